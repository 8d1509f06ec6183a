//! C1 Wire Codec: the masked-header packet format (spec 4.1) and the message
//! bodies it carries once a session's AEAD keys have opened it.

pub mod codec;
pub mod header;
pub mod message;
pub mod packet;

pub use codec::{DecodeError, Discv5Codec, InboundDatagram, OutboundPacket};
pub use message::Message;
pub use packet::{HandshakeAuthdata, OrdinaryAuthdata, Packet, WhoAreYouAuthdata};
