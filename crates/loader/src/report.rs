use core::{error::Error, fmt};

use allocator::{os::MapError, strategy::CreateError};
use snafu::Location;

use crate::exercise::ExerciseError;

#[derive(Debug, Clone, Copy)]
enum Color {
    Red,
    DarkGray,
}

impl Color {
    fn fg(self) -> u8 {
        match self {
            Self::Red => 31,
            Self::DarkGray => 90,
        }
    }
}

struct WithFg<T>(Color, T);

impl<T> fmt::Display for WithFg<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fg = self.0.fg();
        let value = &self.1;
        write!(f, "\x1B[{fg};1m{value}\x1B[0m")
    }
}

/// Finds where a known error of this workspace was raised.
fn location_of<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a Location> {
    if let Some(err) = err.downcast_ref::<ExerciseError>() {
        return Some(err.location());
    }
    if let Some(err) = err.downcast_ref::<CreateError>() {
        return Some(err.location());
    }
    err.downcast_ref::<MapError>().map(MapError::location)
}

/// A printable error report: the error, where it was raised and its cause
/// chain.
pub struct Report<E> {
    error: E,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", WithFg(Color::Red, &self.error))?;
        if let Some(loc) = location_of(&self.error) {
            writeln!(f, "  at {}", WithFg(Color::DarkGray, loc))?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {}", WithFg(Color::Red, s))?;
            if let Some(loc) = location_of(s) {
                writeln!(f, "      at {}", WithFg(Color::DarkGray, loc))?;
            }
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}
