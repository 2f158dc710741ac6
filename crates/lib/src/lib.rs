//! aicard core library: DingTalk Stream mode channel, Dify streaming client, and the
//! relay that projects streamed answers onto AI cards. Used by the `aicard` binary.

pub mod channels;
pub mod config;
pub mod context;
pub mod init;
pub mod llm;
pub mod relay;
