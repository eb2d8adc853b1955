#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
mod log;
pub mod commands;
pub mod event;
pub mod registers;
pub mod remote_ptr;
pub mod scoped_fd;
pub mod task;
pub mod trace;
pub mod util;

