//! Canonical event topic constants shared by the kernel, dispatcher and
//! built-in progs. Keep this list alphabetized within sections and favor
//! dot.case names.

// Strands
pub const TOPIC_STRAND_ERRORED: &str = "strand.errored";
pub const TOPIC_STRAND_EXITED: &str = "strand.exited";
pub const TOPIC_STRAND_LEASE_LOST: &str = "strand.lease.lost";

// Semaphores
pub const TOPIC_SEMAPHORE_INCR: &str = "semaphore.incr";

// Deadlines / pages
pub const TOPIC_DEADLINE_EXPIRED: &str = "deadline.expired";
pub const TOPIC_PAGE_RESOLVED: &str = "page.resolved";
pub const TOPIC_PAGE_TRIGGERED: &str = "page.triggered";

// Dispatcher
pub const TOPIC_DISPATCHER_APOPTOSIS: &str = "dispatcher.apoptosis";
pub const TOPIC_DISPATCHER_GC: &str = "dispatcher.gc";
pub const TOPIC_DISPATCHER_STARTED: &str = "dispatcher.started";
pub const TOPIC_DISPATCHER_STOPPED: &str = "dispatcher.stopped";
