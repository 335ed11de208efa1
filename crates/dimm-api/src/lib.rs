// dimm-api: Async client for the Astelco OpenTPL protocol used by DIMM seeing monitors

pub mod command;
pub mod error;
pub mod reply;
pub mod session;
pub mod table;

pub use command::{CommandId, CommandReply, Completion, DataValue, Verb};
pub use error::Error;
pub use reply::{CommandStatus, Reply};
pub use session::{AccessLevels, LinkState, Session, SessionConfig};
pub use table::CommandTable;
