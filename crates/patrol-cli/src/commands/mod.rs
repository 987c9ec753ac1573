pub mod common;
pub mod history;
pub mod report;
pub mod scan;
pub mod status;
pub mod sync;
pub mod watch;
