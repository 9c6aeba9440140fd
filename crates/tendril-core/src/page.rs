//! Operator-visible pages, each driven by its own `PageNexus` strand.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tendril_kernel::{Frame, Kernel, NewPage, NewStrand, PageInsert};
use tendril_topics as topics;

use crate::ctx::Ctx;
use crate::flow::Flow;
use crate::prog::{Prog, Symbol};
use crate::{counters, prog_enum};

/// How long an open page sleeps between checks when nobody resolves it.
const WAIT_NAP_SECS: u64 = 6 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

pub fn page_tag<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub summary: String,
    pub tag_parts: Vec<String>,
    pub related: Vec<String>,
    pub severity: Severity,
    pub details: Value,
}

prog_enum! {
    pub enum PageLabel { Start => "start", Wait => "wait", Resolve => "resolve" }
}

prog_enum! {
    pub enum PageSemaphore { Resolve => "resolve" }
}

pub struct PageNexus;

impl PageNexus {
    /// Opens a page, or returns the unresolved one already carrying this tag.
    pub async fn assemble(kernel: &Kernel, req: PageRequest) -> Result<PageInsert> {
        let id = uuid::Uuid::new_v4().to_string();
        let tag = page_tag(&req.tag_parts);
        let mut frame = Frame::new();
        frame.insert("tag".into(), json!(tag));
        frame.insert("summary".into(), json!(req.summary));
        frame.insert("severity".into(), json!(req.severity));
        let page = NewPage {
            id: id.clone(),
            tag,
            summary: req.summary,
            severity: req.severity.as_str().to_string(),
            related: req.related,
            details: req.details,
        };
        let strand = NewStrand::new(Self::NAME, PageLabel::Start.as_str(), frame).with_id(id);
        let inserted = kernel.insert_page_async(page, strand).await?;
        counters::page_opened(inserted.created());
        Ok(inserted)
    }

    /// Asks the open page with `tag` to resolve itself. Returns false when
    /// no such page is open.
    pub async fn resolve(kernel: &Kernel, tag: &str) -> Result<bool> {
        match kernel.find_open_page_async(tag).await? {
            Some(page) => {
                kernel
                    .incr_semaphore_async(&page.id, PageSemaphore::Resolve.as_str())
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Prog for PageNexus {
    const NAME: &'static str = "PageNexus";
    type Label = PageLabel;
    type Semaphore = PageSemaphore;

    async fn run(&self, label: PageLabel, ctx: &mut Ctx<'_, Self>) -> Result<Flow> {
        match label {
            PageLabel::Start => {
                let payload = json!({
                    "id": ctx.id(),
                    "tag": ctx.frame().get("tag"),
                    "summary": ctx.frame().get("summary"),
                    "severity": ctx.frame().get("severity"),
                });
                ctx.emit(topics::TOPIC_PAGE_TRIGGERED, &payload);
                Ok(ctx.hop(PageLabel::Wait))
            }
            PageLabel::Wait => {
                if ctx.when_set(PageSemaphore::Resolve) {
                    ctx.decr(PageSemaphore::Resolve);
                    Ok(ctx.hop(PageLabel::Resolve))
                } else {
                    Ok(ctx.nap(WAIT_NAP_SECS))
                }
            }
            PageLabel::Resolve => {
                ctx.kernel().resolve_page_async(ctx.id()).await?;
                let payload = json!({"id": ctx.id(), "tag": ctx.frame().get("tag")});
                ctx.emit(topics::TOPIC_PAGE_RESOLVED, &payload);
                Ok(ctx.pop("page is resolved"))
            }
        }
    }
}
