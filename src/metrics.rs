//! Process-wide mailer counters, cheap enough to bump from every session task.
//! `ftnbbs status` prints a [`snapshot`].
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static SESSIONS_OK: AtomicU64 = AtomicU64::new(0);
static SESSIONS_FAILED: AtomicU64 = AtomicU64::new(0);
static AUTH_FAILURES: AtomicU64 = AtomicU64::new(0);
static BUSY_REJECTIONS: AtomicU64 = AtomicU64::new(0);
static FILES_SENT: AtomicU64 = AtomicU64::new(0);
static FILES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static BYTES_SENT: AtomicU64 = AtomicU64::new(0);
static BYTES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static CRASHMAIL_SENT: AtomicU64 = AtomicU64::new(0);
static CRASHMAIL_FAILED: AtomicU64 = AtomicU64::new(0);

pub fn inc_session(ok: bool) {
    if ok {
        SESSIONS_OK.fetch_add(1, Ordering::Relaxed);
    } else {
        SESSIONS_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn inc_auth_failure() {
    AUTH_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_busy_rejection() {
    BUSY_REJECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn add_file_sent(bytes: u64) {
    FILES_SENT.fetch_add(1, Ordering::Relaxed);
    BYTES_SENT.fetch_add(bytes, Ordering::Relaxed);
}

pub fn add_file_received(bytes: u64) {
    FILES_RECEIVED.fetch_add(1, Ordering::Relaxed);
    BYTES_RECEIVED.fetch_add(bytes, Ordering::Relaxed);
}

pub fn inc_crashmail(sent: bool) {
    if sent {
        CRASHMAIL_SENT.fetch_add(1, Ordering::Relaxed);
    } else {
        CRASHMAIL_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MailerCounters {
    pub sessions_ok: u64,
    pub sessions_failed: u64,
    pub auth_failures: u64,
    pub busy_rejections: u64,
    pub files_sent: u64,
    pub files_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub crashmail_sent: u64,
    pub crashmail_failed: u64,
}

pub fn snapshot() -> MailerCounters {
    MailerCounters {
        sessions_ok: SESSIONS_OK.load(Ordering::Relaxed),
        sessions_failed: SESSIONS_FAILED.load(Ordering::Relaxed),
        auth_failures: AUTH_FAILURES.load(Ordering::Relaxed),
        busy_rejections: BUSY_REJECTIONS.load(Ordering::Relaxed),
        files_sent: FILES_SENT.load(Ordering::Relaxed),
        files_received: FILES_RECEIVED.load(Ordering::Relaxed),
        bytes_sent: BYTES_SENT.load(Ordering::Relaxed),
        bytes_received: BYTES_RECEIVED.load(Ordering::Relaxed),
        crashmail_sent: CRASHMAIL_SENT.load(Ordering::Relaxed),
        crashmail_failed: CRASHMAIL_FAILED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and other tests bump them concurrently, so only
    // check monotonic growth.
    #[test]
    fn counters_grow() {
        let before = snapshot();
        add_file_sent(100);
        add_file_received(50);
        inc_session(true);
        inc_crashmail(false);
        let after = snapshot();
        assert!(after.files_sent > before.files_sent);
        assert!(after.bytes_sent >= before.bytes_sent + 100);
        assert!(after.bytes_received >= before.bytes_received + 50);
        assert!(after.sessions_ok > before.sessions_ok);
        assert!(after.crashmail_failed > before.crashmail_failed);
    }
}
