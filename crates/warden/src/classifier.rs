//! Resource Classifier - where does a declared id live on the host?

use crate::platform::Host;
use std::collections::BTreeSet;
use warden_common::{ResourceKind, Result, WardenError};

/// Observed existence of one id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Container,
    Vm,
    Missing,
    /// Listed as both kinds. Never silently resolved.
    Ambiguous,
}

impl Classification {
    pub fn describe(&self) -> &'static str {
        match self {
            Classification::Container => "container",
            Classification::Vm => "vm",
            Classification::Missing => "missing",
            Classification::Ambiguous => "both container and vm",
        }
    }
}

/// What the dispatcher should do with a declared entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Existing,
    Missing,
}

/// Pure classification against two point-in-time listings
pub fn classify_id(id: u32, containers: &BTreeSet<u32>, vms: &BTreeSet<u32>) -> Classification {
    match (containers.contains(&id), vms.contains(&id)) {
        (true, true) => Classification::Ambiguous,
        (true, false) => Classification::Container,
        (false, true) => Classification::Vm,
        (false, false) => Classification::Missing,
    }
}

/// Query both listings and classify `id`.
///
/// A failed listing is an error: creating on top of an unknown host state
/// could clash with an existing id.
pub async fn classify(host: &Host, id: u32) -> Result<Classification> {
    let containers = host.list_ids(ResourceKind::Container).await?;
    let vms = host.list_ids(ResourceKind::Vm).await?;
    Ok(classify_id(id, &containers, &vms))
}

/// Check the declared kind against the observed one
pub fn resolve(id: u32, declared: ResourceKind, observed: Classification) -> Result<Disposition> {
    let conflict = || WardenError::TypeConflict {
        id,
        declared,
        observed: observed.describe().to_string(),
    };
    match (declared, observed) {
        (_, Classification::Missing) => Ok(Disposition::Missing),
        (ResourceKind::Container, Classification::Container)
        | (ResourceKind::Vm, Classification::Vm) => Ok(Disposition::Existing),
        _ => Err(conflict()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_id() {
        let cts = BTreeSet::from([101, 102]);
        let vms = BTreeSet::from([200, 102]);
        assert_eq!(classify_id(101, &cts, &vms), Classification::Container);
        assert_eq!(classify_id(200, &cts, &vms), Classification::Vm);
        assert_eq!(classify_id(300, &cts, &vms), Classification::Missing);
        assert_eq!(classify_id(102, &cts, &vms), Classification::Ambiguous);
    }

    #[test]
    fn test_resolve_matching_kinds() {
        assert_eq!(
            resolve(101, ResourceKind::Container, Classification::Container).unwrap(),
            Disposition::Existing
        );
        assert_eq!(
            resolve(200, ResourceKind::Vm, Classification::Vm).unwrap(),
            Disposition::Existing
        );
        assert_eq!(
            resolve(300, ResourceKind::Vm, Classification::Missing).unwrap(),
            Disposition::Missing
        );
    }

    #[test]
    fn test_resolve_conflicts() {
        let err = resolve(100, ResourceKind::Vm, Classification::Container).unwrap_err();
        match err {
            WardenError::TypeConflict { id, declared, observed } => {
                assert_eq!(id, 100);
                assert_eq!(declared, ResourceKind::Vm);
                assert_eq!(observed, "container");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(resolve(102, ResourceKind::Container, Classification::Ambiguous).is_err());
        assert!(resolve(102, ResourceKind::Vm, Classification::Ambiguous).is_err());
    }
}
