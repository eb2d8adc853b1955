use std::io;

pub mod dump_command;
pub mod rd_options;
pub mod trace_info_command;

pub trait RdCommand {
    fn run(&mut self) -> io::Result<()>;
}
