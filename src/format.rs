//! Human and machine readable renderings of results and of the catalog.

use std::fmt::Write;

use colored::Colorize;

use crate::{
    measure::Measure,
    provider::{provider_infos, ProviderId},
    result::Results,
};

const RULE: &str = "============================================================";

/// Results grouped by provider, one `NAME  value` line per measure.
pub fn simple(results: &Results) -> String {
    let width = results.measures().map(|m| m.name().len()).max().unwrap_or(0);
    let mut out = String::new();
    let mut current: Option<ProviderId> = None;

    let mut entries: Vec<_> = results.iter().collect();
    entries.sort_by_key(|(measure, _)| (measure.info().provider, **measure));
    for (measure, entry) in entries {
        let provider = measure.info().provider;
        if current != Some(provider) {
            let _ = writeln!(out, "{}\n{}", RULE.red(), provider.to_string().cyan());
            current = Some(provider);
        }
        let _ = writeln!(
            out,
            "  {:<width$}  {}",
            measure.name().bold(),
            entry.value.green()
        );
    }
    out
}

/// Results as a pretty-printed JSON object keyed by measure name.
pub fn json(results: &Results) -> String {
    serde_json::to_string_pretty(results).unwrap_or_else(|e| {
        log::error!("cannot serialize results: {e}");
        String::from("{}")
    })
}

/// Every provider with the measures it supplies, as listed by `measure --list`.
pub fn catalog() -> String {
    let mut out = String::new();
    for info in provider_infos() {
        let kind = if info.continuous { "interval" } else { "one-shot" };
        let _ = writeln!(
            out,
            "{}\n{} {} ({kind}): {}",
            RULE.red(),
            info.id.to_string().cyan(),
            info.version,
            info.description
        );
        for measure in &info.measures {
            let _ = writeln!(out, "{}", describe(*measure));
        }
    }
    out
}

fn describe(measure: Measure) -> String {
    let info = measure.info();
    format!(
        "  {} [{}] {}",
        measure.name().bold(),
        info.result_type,
        info.description
    )
}
