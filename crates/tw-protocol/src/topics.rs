//! MQTT topic builders and matching for the AWS IoT reserved topic families.
//!
//! Topic structure:
//! ```text
//! $aws/things/{thing}/shadow/{get|update|delete}[/accepted|/rejected]
//! $aws/things/{thing}/shadow/name/{shadow}/{get|update|delete}[/accepted|/rejected]
//! $aws/things/{thing}/shadow/update/documents
//! $aws/things/{thing}/jobs/{notify|notify-next|next|next-notify}
//! $aws/things/{thing}/jobs/get[/accepted|/rejected]
//! $aws/things/{thing}/tunnels/notify
//! $aws/certificates/create/json[/accepted|/rejected]
//! $aws/provisioning-templates/{template}/provision/json[/accepted|/rejected]
//! ```
//!
//! Every request topic that expects a reply has an `accepted` and a
//! `rejected` sibling, built with [`accepted`] and [`rejected`].

const THINGS: &str = "$aws/things";
const CERTIFICATES: &str = "$aws/certificates";
const TEMPLATES: &str = "$aws/provisioning-templates";

// ─── Reply siblings ───

/// The `accepted` reply topic paired with a request topic.
pub fn accepted(request: &str) -> String {
    format!("{request}/accepted")
}

/// The `rejected` reply topic paired with a request topic.
pub fn rejected(request: &str) -> String {
    format!("{request}/rejected")
}

// ─── Shadow topics ───

/// Root of a thing's shadow topics. `None` addresses the classic (unnamed) shadow.
pub fn shadow_root(thing: &str, shadow: Option<&str>) -> String {
    match shadow {
        Some(name) => format!("{THINGS}/{thing}/shadow/name/{name}"),
        None => format!("{THINGS}/{thing}/shadow"),
    }
}

pub fn shadow_get(thing: &str, shadow: Option<&str>) -> String {
    format!("{}/get", shadow_root(thing, shadow))
}

pub fn shadow_update(thing: &str, shadow: Option<&str>) -> String {
    format!("{}/update", shadow_root(thing, shadow))
}

pub fn shadow_update_documents(thing: &str, shadow: Option<&str>) -> String {
    format!("{}/update/documents", shadow_root(thing, shadow))
}

pub fn shadow_delete(thing: &str, shadow: Option<&str>) -> String {
    format!("{}/delete", shadow_root(thing, shadow))
}

// ─── Jobs topics ───

pub fn jobs_notify(thing: &str) -> String {
    format!("{THINGS}/{thing}/jobs/notify")
}

pub fn jobs_notify_next(thing: &str) -> String {
    format!("{THINGS}/{thing}/jobs/notify-next")
}

pub fn jobs_get(thing: &str) -> String {
    format!("{THINGS}/{thing}/jobs/get")
}

pub fn jobs_next(thing: &str) -> String {
    format!("{THINGS}/{thing}/jobs/next")
}

pub fn jobs_next_notify(thing: &str) -> String {
    format!("{THINGS}/{thing}/jobs/next-notify")
}

// ─── Secure tunneling ───

pub fn tunnels_notify(thing: &str) -> String {
    format!("{THINGS}/{thing}/tunnels/notify")
}

// ─── Fleet provisioning ───

/// CreateKeysAndCertificate request topic (JSON payload format).
pub fn certificates_create() -> String {
    format!("{CERTIFICATES}/create/json")
}

/// RegisterThing request topic for a provisioning template.
pub fn provision(template: &str) -> String {
    format!("{TEMPLATES}/{template}/provision/json")
}

// ─── Filter matching ───

/// Whether a concrete topic matches a subscription filter.
///
/// Follows MQTT 3.1.1 rules: `+` matches exactly one level, a trailing `#`
/// matches the parent level and everything below it, and filters starting
/// with a wildcard never match `$`-prefixed topics.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
