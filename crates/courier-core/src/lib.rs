pub mod clock;
pub mod errors;
pub mod ids;
pub mod key;
pub mod message;
pub mod mock;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::SendError;
pub use ids::QueueEntryId;
pub use key::{ChannelType, ConversationChannelKey};
pub use message::{MessageKind, OutboundContent, Payload};
pub use transport::{MessageTransport, SendReceipt, SendRequest};
