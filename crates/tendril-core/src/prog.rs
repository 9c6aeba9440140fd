use anyhow::Result;
use async_trait::async_trait;

use crate::ctx::Ctx;
use crate::flow::Flow;

/// A closed set of names persisted as strings: labels and semaphore names.
pub trait Symbol: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

/// Declares a [`Symbol`] enum mapping each variant to its persisted name.
///
/// ```
/// tendril_core::prog_enum! {
///     pub enum Label { Start => "start", Wait => "wait" }
/// }
/// ```
#[macro_export]
macro_rules! prog_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $text:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        $vis enum $name { $($variant),* }

        impl $crate::Symbol for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),*];

            fn as_str(&self) -> &'static str {
                match *self {
                    $(Self::$variant => $text),*
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::Symbol::as_str(self))
            }
        }
    };
}

prog_enum! {
    /// Semaphore set of progs that take no signals.
    pub enum NoSemaphore {}
}

/// Behavior bound to a strand: one handler per label.
///
/// Handlers must be idempotent with respect to partial completion. A crash
/// after an external side effect but before the commit re-runs the same
/// label from the last persisted state.
#[async_trait]
pub trait Prog: Sized + Send + Sync + 'static {
    const NAME: &'static str;
    type Label: Symbol;
    type Semaphore: Symbol;

    /// Runs before every label handler. Returning a flow skips the handler;
    /// the usual use is redirecting to a destroy label once `destroy` is set.
    async fn before_run(&self, _ctx: &mut Ctx<'_, Self>) -> Result<Option<Flow>> {
        Ok(None)
    }

    async fn run(&self, label: Self::Label, ctx: &mut Ctx<'_, Self>) -> Result<Flow>;
}
