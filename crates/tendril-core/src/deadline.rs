//! Independent watchdog over deadlines registered on strand frames.
//!
//! A strand that is wedged cannot report its own lateness, so the monitor
//! reads the top frame of every unfinished strand and opens a page for each
//! registration that has expired without the strand reaching its target.

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tendril_events::Bus;
use tendril_kernel::{Kernel, PageInsert, StrandRow, FRAME_DEADLINE_AT, FRAME_DEADLINE_TARGET};
use tendril_topics as topics;

use crate::page::{page_tag, PageNexus, PageRequest, PageSemaphore, Severity};
use crate::prog::Symbol;

pub fn deadline_tag(strand_id: &str, prog: &str, target: Option<&str>) -> String {
    page_tag(&["Deadline", strand_id, prog, target.unwrap_or("exit")])
}

/// `(target, deadline_at)` of the registration on the strand's top frame.
pub(crate) fn registration(strand: &StrandRow) -> Option<(Option<String>, String)> {
    let top = strand.top_frame()?;
    let at = top.get(FRAME_DEADLINE_AT)?.as_str()?.to_string();
    let target = top
        .get(FRAME_DEADLINE_TARGET)
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((target, at))
}

#[derive(Clone)]
pub struct DeadlineMonitor {
    kernel: Kernel,
    bus: Bus,
}

impl DeadlineMonitor {
    pub fn new(kernel: Kernel, bus: Bus) -> Self {
        Self { kernel, bus }
    }

    /// One pass over expired registrations. Pages are idempotent per tag, so
    /// repeated sweeps before resolution return `Existing` entries.
    pub async fn sweep(&self) -> Result<Vec<PageInsert>> {
        let expired = self.kernel.expired_deadlines_async(Utc::now()).await?;
        let mut pages = Vec::with_capacity(expired.len());
        for strand in expired {
            if let Some(page) = self.escalate(&strand).await? {
                pages.push(page);
            }
        }
        Ok(pages)
    }

    /// Opens the page for `strand`'s expired registration as read by the
    /// sweep. The strand may commit in between; a fresh page whose
    /// registration is already gone is told to resolve itself.
    pub(crate) async fn escalate(&self, strand: &StrandRow) -> Result<Option<PageInsert>> {
        let Some((target, at)) = registration(strand) else {
            return Ok(None);
        };
        if target.as_deref() == Some(strand.label.as_str()) {
            return Ok(None);
        }
        let target_name = target.as_deref().unwrap_or("exit");
        let req = PageRequest {
            summary: format!(
                "{} has an expired deadline! {}.{} did not reach {} on time",
                strand.id, strand.prog, strand.label, target_name
            ),
            tag_parts: vec![
                "Deadline".to_string(),
                strand.id.clone(),
                strand.prog.clone(),
                target_name.to_string(),
            ],
            related: vec![strand.id.clone()],
            severity: Severity::Error,
            details: json!({
                "prog": strand.prog,
                "label": strand.label,
                "deadline_target": target,
                "deadline_at": at,
            }),
        };
        let page = PageNexus::assemble(&self.kernel, req).await?;
        if !page.created() {
            return Ok(Some(page));
        }
        if !self.still_pending(strand, &target).await? {
            tracing::debug!(strand = %strand.id, page = %page.page().id, "deadline cleared while paging");
            self.kernel
                .incr_semaphore_async(&page.page().id, PageSemaphore::Resolve.as_str())
                .await?;
            return Ok(Some(page));
        }
        tracing::warn!(
            strand = %strand.id,
            prog = %strand.prog,
            label = %strand.label,
            target = target_name,
            "deadline expired"
        );
        self.bus.publish(
            topics::TOPIC_DEADLINE_EXPIRED,
            Some(&strand.id),
            &json!({"page": page.page().id, "deadline_at": at}),
        );
        Ok(Some(page))
    }

    /// Whether the stored strand still carries the registration the page
    /// was opened for.
    async fn still_pending(&self, seen: &StrandRow, target: &Option<String>) -> Result<bool> {
        let Some(now) = self.kernel.get_strand_async(&seen.id).await? else {
            return Ok(false);
        };
        if now.is_finished() || now.prog != seen.prog {
            return Ok(false);
        }
        match registration(&now) {
            Some((t, _)) => Ok(&t == target && t.as_deref() != Some(now.label.as_str())),
            None => Ok(false),
        }
    }
}
