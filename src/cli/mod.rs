pub(crate) mod catalog;
pub(crate) mod command;
pub(crate) mod listen;
pub(crate) mod scan;
pub(crate) mod send;
pub(crate) mod ui;

pub use self::catalog::CatalogArgs;
pub use self::command::{Args, Command, FakeArgs, LogLevel};
pub use self::listen::ListenArgs;
pub use self::scan::ScanArgs;
pub use self::send::SendArgs;
