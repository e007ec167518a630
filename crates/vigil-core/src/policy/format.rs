//! Rendering of rule output templates.
//!
//! A template interleaves literal text with `%field` references; the
//! known fields resolve against the matched event, unknown references
//! are left verbatim so a template mismatch stays visible downstream.

use crate::event::Event;

const FIELDS: [&str; 5] = [
    "container.id",
    "thread.tid",
    "proc.pid",
    "evt.type",
    "evt.ts",
];

/// Renders `template` against `event`.
#[must_use]
pub fn render(template: &str, event: &Event) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        match FIELDS.iter().find(|field| rest.starts_with(**field)) {
            Some(field) => {
                match *field {
                    "evt.type" => out.push_str(event.event_type.name()),
                    "evt.ts" => out.push_str(&event.ts_ns.to_string()),
                    "proc.pid" => out.push_str(&event.process_id.to_string()),
                    "thread.tid" => out.push_str(&event.thread_id.to_string()),
                    "container.id" => out.push_str(event.container().unwrap_or("host")),
                    _ => unreachable!("FIELDS is exhaustive"),
                }
                rest = &rest[field.len()..];
            },
            None => out.push('%'),
        }
    }
    out.push_str(rest);
    out
}
