//! The query engine.
//!
//! Matching runs over a snapshot of the live registry and emits once, in
//! registry insertion order. The protocol filter and property filter match
//! independently; the result is their intersection.

use thiserror::Error;

use hyprtavern_core::proto::FilterMode;

use crate::registry::BusObject;

/// A frozen query.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    /// Protocol names to match, by name only (revision is ignored).
    pub protocols: Vec<String>,
    /// Combinator for `protocols`.
    pub protocol_filter: FilterMode,
    /// `name=value` property filters.
    pub properties: Vec<String>,
    /// Combinator for `properties`.
    pub property_filter: FilterMode,
}

/// Query rejection: the whole query fails, no partial results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueryError {
    /// A property filter element is missing its `=`.
    #[error("invalid property in query")]
    InvalidProperty,
}

fn protocols_match(spec: &QuerySpec, obj: &BusObject) -> bool {
    if spec.protocols.is_empty() {
        return true;
    }

    let has = |name: &String| obj.protocols.iter().any(|p| &p.name == name);

    match spec.protocol_filter {
        FilterMode::All => spec.protocols.iter().all(has),
        FilterMode::Any => spec.protocols.iter().any(has),
    }
}

fn properties_match(pairs: &[(&str, &str)], mode: FilterMode, obj: &BusObject) -> bool {
    if pairs.is_empty() {
        return true;
    }

    let has = |&(name, value): &(&str, &str)| {
        obj.properties.iter().any(|(n, v)| n == name && v == value)
    };

    match mode {
        FilterMode::All => pairs.iter().all(has),
        FilterMode::Any => pairs.iter().any(has),
    }
}

/// Run `spec` over the given registry snapshot.
///
/// # Errors
///
/// [`QueryError::InvalidProperty`] if any property element lacks `=`; no
/// partial results are produced.
pub fn run_query<'a>(
    spec: &QuerySpec,
    objects: impl Iterator<Item = &'a BusObject>,
) -> Result<Vec<u32>, QueryError> {
    let pairs = spec
        .properties
        .iter()
        .map(|p| p.split_once('=').ok_or(QueryError::InvalidProperty))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(objects
        .filter(|obj| protocols_match(spec, obj) && properties_match(&pairs, spec.property_filter, obj))
        .map(|obj| obj.internal_id)
        .collect())
}
