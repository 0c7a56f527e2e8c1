//! Wire protocol: the binary serial frame codec and the TCP text-command
//! grammar.

pub mod codec;
pub mod command;

pub use codec::{decode_frame, encode_frame, CodecError, Frame, FrameLimits, FrameType};
pub use command::{parse_command, Command, CommandError};
