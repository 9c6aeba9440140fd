use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tendril_kernel::KernelError;

use crate::ctx::{Ctx, Tick};
use crate::flow::Flow;
use crate::page::PageNexus;
use crate::prog::{Prog, Symbol};

/// Object-safe face of a [`Prog`], so strands of different progs can share
/// one runner.
#[async_trait]
pub(crate) trait DynProg: Send + Sync {
    fn has_label(&self, label: &str) -> bool;

    fn has_semaphore(&self, name: &str) -> bool;

    async fn run_tick(&self, tick: &mut Tick) -> Result<Flow>;
}

struct Entry<P: Prog>(P);

#[async_trait]
impl<P: Prog> DynProg for Entry<P> {
    fn has_label(&self, label: &str) -> bool {
        P::Label::parse(label).is_some()
    }

    fn has_semaphore(&self, name: &str) -> bool {
        P::Semaphore::parse(name).is_some()
    }

    async fn run_tick(&self, tick: &mut Tick) -> Result<Flow> {
        let label = P::Label::parse(&tick.label).ok_or_else(|| KernelError::UnknownLabel {
            prog: P::NAME.to_string(),
            label: tick.label.clone(),
        })?;
        let mut ctx = Ctx::<P>::new(tick);
        if let Some(flow) = self.0.before_run(&mut ctx).await? {
            return Ok(flow);
        }
        self.0.run(label, &mut ctx).await
    }
}

/// Maps persisted prog names to their handlers.
#[derive(Default)]
pub struct Registry {
    progs: BTreeMap<&'static str, Arc<dyn DynProg>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows the progs the runtime itself relies on.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(PageNexus);
        registry
    }

    pub fn register<P: Prog>(&mut self, prog: P) -> &mut Self {
        if self.progs.insert(P::NAME, Arc::new(Entry(prog))).is_some() {
            tracing::warn!(prog = P::NAME, "prog registered twice; keeping the latest");
        }
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.progs.keys().copied().collect()
    }

    pub fn contains(&self, prog: &str) -> bool {
        self.progs.contains_key(prog)
    }

    pub(crate) fn get(&self, prog: &str) -> Result<Arc<dyn DynProg>> {
        self.progs
            .get(prog)
            .cloned()
            .ok_or_else(|| KernelError::UnknownProg(prog.to_string()).into())
    }

    pub fn validate_label(&self, prog: &str, label: &str) -> Result<()> {
        if self.get(prog)?.has_label(label) {
            Ok(())
        } else {
            Err(KernelError::UnknownLabel {
                prog: prog.to_string(),
                label: label.to_string(),
            }
            .into())
        }
    }

    pub fn validate_semaphore(&self, prog: &str, name: &str) -> Result<()> {
        if self.get(prog)?.has_semaphore(name) {
            Ok(())
        } else {
            Err(KernelError::UnknownSemaphore {
                prog: prog.to_string(),
                name: name.to_string(),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_know_the_page_nexus() {
        let registry = Registry::with_builtins();
        assert!(registry.contains("PageNexus"));
        registry.validate_label("PageNexus", "wait").unwrap();
        let err = registry.validate_label("PageNexus", "nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KernelError>(),
            Some(KernelError::UnknownLabel { .. })
        ));
        let err = registry.validate_label("Missing", "start").unwrap_err();
        assert_eq!(
            err.downcast_ref::<KernelError>(),
            Some(&KernelError::UnknownProg("Missing".into()))
        );
    }

    #[test]
    fn semaphore_names_are_checked_against_the_prog() {
        let registry = Registry::with_builtins();
        registry.validate_semaphore("PageNexus", "resolve").unwrap();
        let err = registry.validate_semaphore("PageNexus", "resovle").unwrap_err();
        assert_eq!(
            err.downcast_ref::<KernelError>(),
            Some(&KernelError::UnknownSemaphore {
                prog: "PageNexus".into(),
                name: "resovle".into(),
            })
        );
    }
}
