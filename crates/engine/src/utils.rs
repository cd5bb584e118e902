use std::fmt::Display;

pub trait ErrorExt {
    fn print_on_err(&self, prefix: &str);
}

impl<T, E: Display> ErrorExt for Result<T, E> {
    fn print_on_err(&self, prefix: &str) {
        if let Err(e) = self {
            log::error!("{prefix} got error {e}")
        }
    }
}
