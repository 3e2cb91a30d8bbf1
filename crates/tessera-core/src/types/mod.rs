pub mod block;
pub mod command;
pub mod pblock;
pub mod validator;

pub use block::{Block, BlockInfo};
pub use command::{Command, CommandType};
pub use pblock::PBlock;
pub use validator::{NonInclusionVote, PBlockNotification, ValidatorRecord};
