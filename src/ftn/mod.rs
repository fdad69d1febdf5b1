//! FidoNet technology primitives shared by the mailer: addresses and packets.

pub mod address;
pub mod packet;

pub use address::{parse_address_list, AddressError, FtnAddress, NetworkPattern};
pub use packet::{FtnMessage, FtsPacketStore, PacketStore, PktHeader};
