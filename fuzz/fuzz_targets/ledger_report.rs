#![no_main]

use hooktime::aggregate::{aggregate, AggregationPolicy};
use hooktime::ledger::LedgerSnapshot;
use hooktime::report::{render_text, ReportStyle};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Any saved ledger either aggregates or is rejected with a violation
        if let Ok(snapshot) = LedgerSnapshot::from_json(input) {
            if let Ok(result) = aggregate(&snapshot, &AggregationPolicy::default()) {
                let _ = render_text(&result, &ReportStyle::default());
            }
        }
    }
});
