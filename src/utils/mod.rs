pub mod clock;
pub mod dir;
pub mod domain;
pub mod logging;
pub mod time;
