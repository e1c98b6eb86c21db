//! Run-time selection of the allocator strategy.
//!
//! Strategies are registered under a canonical name and any number of
//! aliases. An identifier given on the command line is matched exactly first;
//! failing that, it is reduced to a bare name the way a shared-object path
//! would be (`./lib2n_degree_blocks.so` becomes `2n_degree_blocks`) and
//! matched again.
//!
//! [`bind`] never fails: an absent identifier, an unknown one or one naming an
//! incomplete implementation all bind the OS-backed fallback.

use std::path::Path;

use allocator::{
    first_fit::FirstFit,
    os::OsPages,
    size_class::{ClassLookup, SizeClass},
    strategy::{Operations, Strategy},
};
use derive_more::Display;
use snafu::{Location, Snafu, ensure};

/// The error type returned when an identifier does not name a usable
/// strategy.
#[derive(Debug, Snafu)]
pub enum ResolveError {
    #[snafu(display("empty allocator identifier"))]
    EmptyIdentifier {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no allocator named {id:?}"))]
    NotFound {
        id: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocator {id:?} does not provide {}", operation_names(*missing)))]
    MissingOperations {
        id: String,
        missing: Operations,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ResolveError {
    #[must_use]
    pub fn location(&self) -> &Location {
        match self {
            Self::EmptyIdentifier { location }
            | Self::NotFound { location, .. }
            | Self::MissingOperations { location, .. } => location,
        }
    }
}

fn operation_names(ops: Operations) -> String {
    ops.iter_names()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(", ")
}

struct Entry {
    strategy: Box<dyn Strategy>,
    aliases: Vec<&'static str>,
}

impl Entry {
    fn matches(&self, id: &str) -> bool {
        self.strategy.name() == id || self.aliases.contains(&id)
    }
}

/// The set of strategies an identifier can be resolved against.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// Creates a registry holding the size-class and first-fit strategies.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register(SizeClass::default(), &["2n_degree_blocks", "size_class"]);
        registry.register(
            SizeClass {
                lookup: ClassLookup::OffsetInferred,
            },
            &["size_class_offset"],
        );
        registry.register(FirstFit, &["free_list_blocks", "first_fit"]);
        registry
    }

    pub fn register<S>(&mut self, strategy: S, aliases: &[&'static str])
    where
        S: Strategy + 'static,
    {
        debug!("registering allocator {}", strategy.name());
        self.entries.push(Entry {
            strategy: Box::new(strategy),
            aliases: aliases.to_vec(),
        });
    }

    /// Iterates over the canonical names of the registered strategies.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|entry| entry.strategy.name())
    }

    /// Finds the strategy named by `id`.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<&dyn Strategy> {
        let find = |id: &str| {
            self.entries
                .iter()
                .find(|entry| entry.matches(id))
                .map(|entry| entry.strategy.as_ref())
        };
        find(id).or_else(|| normalize(id).and_then(find))
    }

    /// Finds the strategy named by `id` and checks that it provides every
    /// operation.
    pub fn resolve(&self, id: &str) -> Result<&dyn Strategy, ResolveError> {
        ensure!(!id.is_empty(), EmptyIdentifierSnafu);
        let strategy = self.lookup(id).ok_or_else(|| NotFoundSnafu { id }.build())?;
        let missing = Operations::all().difference(strategy.exports());
        ensure!(missing.is_empty(), MissingOperationsSnafu { id, missing });
        Ok(strategy)
    }
}

/// Reduces a path-like identifier to its file stem without a `lib` prefix.
fn normalize(id: &str) -> Option<&str> {
    let stem = Path::new(id).file_stem()?.to_str()?;
    Some(stem.strip_prefix("lib").unwrap_or(stem))
}

/// Where a bound strategy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BindingSource {
    /// The strategy named by the caller.
    #[display("external")]
    External,
    /// The OS-backed default, bound because the named one was unusable.
    #[display("fallback")]
    Fallback,
}

/// The strategy selected for the lifetime of the process.
#[derive(Clone, Copy)]
pub struct Binding<'r> {
    pub strategy: &'r dyn Strategy,
    pub source: BindingSource,
}

static FALLBACK: OsPages = OsPages;

impl Binding<'_> {
    fn fallback() -> Self {
        Self {
            strategy: &FALLBACK,
            source: BindingSource::Fallback,
        }
    }
}

/// Selects the strategy for `id`, falling back to [`OsPages`] with a
/// diagnostic when `id` is absent or unusable.
pub fn bind<'r>(registry: &'r Registry, id: Option<&str>) -> Binding<'r> {
    let Some(id) = id.filter(|id| !id.is_empty()) else {
        warn!("Using default allocator");
        return Binding::fallback();
    };
    match registry.resolve(id) {
        Ok(strategy) => {
            info!("using allocator {} for {id:?}", strategy.name());
            Binding {
                strategy,
                source: BindingSource::External,
            }
        }
        Err(err) => {
            error!(
                "Failed loading allocator functions: {err} (at {})",
                err.location()
            );
            Binding::fallback()
        }
    }
}
