//! polychat: route one question to many AI chat backends and stream every
//! answer back over a single duplex channel.
//!
//! The core pieces: a provider dispatch table ([`backends`]), a channel
//! multiplexer that tags per-target streams ([`channel`]), the fanout
//! orchestrator ([`fanout`]), and the client-side stream reducer that
//! demultiplexes them back into per-target buffers ([`reducer`]).

pub mod aggregation;
pub mod backends;
pub mod channel;
pub mod config;
pub mod error;
pub mod fanout;
pub mod reducer;
pub mod router;
pub mod session;
pub mod storage;

pub use backends::{Invoker, InvokerRegistry, ProviderKind};
pub use channel::{Channel, ChannelEvent, ChildChannel, FanoutTag, PortRequest, StreamUpdate};
pub use config::{ApiMode, ProviderGroup, SharedConfig, UserConfig};
pub use error::{ChannelClosed, InvokeError};
pub use fanout::{run_fanout, FanoutMode, FanoutRequest, Run, TargetSpec};
pub use reducer::{StreamReducer, TargetStatus};
pub use router::Router;
pub use session::{ConversationRecord, RecordMeta, Session, StateFragment, Target};
