pub mod chat;

pub use chat::{ChatArgs, chat_command};
