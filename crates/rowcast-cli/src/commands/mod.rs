mod init;
mod replay;
mod run;
mod set_offset;
mod status;
mod validate;

pub use init::cmd_init;
pub use replay::cmd_replay;
pub use run::cmd_run;
pub use set_offset::cmd_set_offset;
pub use status::cmd_status;
pub use validate::cmd_validate;
