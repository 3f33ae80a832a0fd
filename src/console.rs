//! A `print!`/`println!` pair over a spin-lock-guarded stdout writer, used
//! sparingly by the cache itself for init and steal diagnostics.

use crate::spinlock::SpinLock;
use std::fmt;
use std::io::Write;

struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::io::stdout().write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

static PRINT_LOCK: SpinLock<()> = SpinLock::new((), "console");

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write as _;
    let _guard = PRINT_LOCK.lock();
    let _ = Writer.write_fmt(args);
}

macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

pub(crate) use print;
pub(crate) use println;
