//! A RakNet-compatible reliable UDP transport: a connectionless datagram protocol providing
//!  a game-oriented mix of reliability, ordering, sequencing, fragmentation and
//!  acknowledgement over a single UDP socket.
//!
//! ## Design
//!
//! * One socket per endpoint; every remote peer is multiplexed over it. The same `EndPoint`
//!   type plays either the server or the client side of the handshake.
//! * The abstraction is sending / receiving *messages* with a per-message delivery
//!   guarantee ([`Reliability`]), not a byte stream. Messages larger than the negotiated
//!   MTU are fragmented and reassembled transparently; the protocol never relies on
//!   IP-level fragmentation.
//! * Delivery guarantees are per *channel* (up to [`MAX_CHANNELS`]): ordered channels
//!   deliver gaplessly in send order, sequenced channels deliver latest-wins.
//! * Loss is detected on the receiver (gaps in the datagram sequence) and answered with
//!   NACKs for fast retransmission; ACKs positively clear the sender's retransmission
//!   buffer. Retransmission backs off exponentially.
//! * Application callbacks run on their own dispatch task so a slow handler never stalls
//!   the protocol; per peer, callback order is the wire order.
//!
//! ## Wire format
//!
//! A UDP payload whose first byte has the high bit clear is an *offline* message; the first
//! byte is the message identifier and the layouts are fixed (see `offline.rs`). Otherwise
//! it is a *connected* datagram:
//!
//! ```ascii
//! 0: flags (8 bits)
//!    * bit 7: VALID - always set on connected datagrams
//!    * bit 6: ACK   - the datagram is an acknowledgement record list
//!    * bit 5: NACK  - the datagram is a loss report record list
//! 1: datagram sequence number (u24 LE)  - data datagrams only
//! 4: encapsulated messages until the end of the buffer
//! ```
//!
//! Each encapsulated message:
//!
//! ```ascii
//! 0: flags - bits 7:5 reliability id (0..7), bit 4 split fragment
//! 1: payload length in bits (u16 BE)
//! *: message index (u24 LE)                - reliable variants
//! *: sequence index (u24 LE)               - sequenced variants
//! *: ordered index (u24 LE), channel (u8)  - ordered or sequenced variants
//! *: split count (u32 BE), split id (u16 BE), split index (u32 BE) - fragments
//! *: payload
//! ```
//!
//! ACK/NACK record lists are a u16 BE record count followed by records: a tag byte
//! (0x00 range, 0x01 single), a u24 LE sequence number, and for ranges the inclusive u24 LE
//! end. Contiguous runs are condensed into ranges on encode.
//!
//! ## Connection lifecycle
//!
//! Two offline rounds negotiate MTU and exchange GUIDs (`OpenConnectionRequest1/2`,
//! padded request one doubling as the MTU probe), then two connected-mode rounds
//! (`ConnectionRequest` / `ConnectionRequestAccepted` / `NewIncomingConnection`) bring the
//! peer to `LoggedIn`. Liveness is kept with reliable pings; a peer that stays silent past
//! the configured timeout, or floods past the packets-per-second cap, is disconnected (the
//! latter also blocks its IP for a while).

pub mod codec;
pub mod config;
pub mod connected;
pub mod datagram;
pub mod encapsulated;
pub mod end_point;
pub mod error;
pub mod events;
pub mod offline;
pub mod peer;
mod receive_queue;
pub mod reliability;
mod send_pipeline;
mod send_queue;

pub use config::RakNetConfig;
pub use end_point::{EndPoint, Recipient, Role};
pub use error::{DisconnectReason, RakNetError};
pub use events::{EventSink, PeerHandle, Receipt};
pub use peer::PeerState;
pub use reliability::Reliability;

/// Number of independent ordered / sequenced channels per connection
pub const MAX_CHANNELS: usize = 32;

/// Smallest transfer unit the protocol operates with
pub const MINIMUM_MTU: u16 = 400;

/// Default cap on the transfer unit: full Ethernet frames without optional headers
pub const MAXIMUM_MTU: u16 = 1492;

/// Version of this wire protocol, checked during the offline handshake
pub const PROTOCOL_VERSION: u8 = 10;
