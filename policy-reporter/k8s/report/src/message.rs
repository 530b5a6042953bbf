//! Parses the messages Kyverno attaches to blocked admission events.
//!
//! Messages have the shape `<Kind> [<namespace>/]<name>: [<rule>] <result> (blocked)`.
//! The format is owned by Kyverno and is not versioned, so parsing is strictly
//! positional and anything unexpected is rejected.

/// The resource and rule named by a blocked admission event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockedResource {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub rule: String,
}

pub const BLOCKED: &str = "(blocked)";

pub fn is_blocked(message: &str) -> bool {
    message.contains(BLOCKED)
}

pub fn parse_message(message: &str) -> Option<BlockedResource> {
    let mut parts = message.split(' ');
    let kind = parts.next()?.trim();
    let resource = parts.next()?;
    let rule = parts.next()?;

    let resource = resource.strip_suffix(':').unwrap_or(resource);
    let (namespace, name) = match resource.split_once('/') {
        Some((namespace, name)) => (namespace.trim(), name.trim()),
        None => ("", resource.trim()),
    };
    let rule = rule.strip_prefix('[')?.strip_suffix(']')?.trim();

    if kind.is_empty() || name.is_empty() {
        return None;
    }

    Some(BlockedResource {
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        rule: rule.to_string(),
    })
}
