use metrics::counter;

pub(crate) fn tick(prog: &str, flow: &'static str) {
    counter!("tendril_ticks_total", "prog" => prog.to_string(), "flow" => flow).increment(1);
}

pub(crate) fn tick_failed(prog: &str) {
    counter!("tendril_tick_errors_total", "prog" => prog.to_string()).increment(1);
}

pub(crate) fn lease_lost() {
    counter!("tendril_leases_lost_total").increment(1);
}

pub(crate) fn apoptosis() {
    counter!("tendril_apoptosis_total").increment(1);
}

pub(crate) fn page_opened(created: bool) {
    let outcome = if created { "created" } else { "existing" };
    counter!("tendril_pages_total", "outcome" => outcome).increment(1);
}

pub(crate) fn purged(n: usize) {
    counter!("tendril_strands_purged_total").increment(n as u64);
}
