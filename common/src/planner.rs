use anyhow::{bail, Result};
use std::collections::BTreeMap;

use crate::builder::UnitDescriptor;

/// Reparte los descriptores entre hosts: todas las unidades de la partición
/// `p` van a `hosts[p % hosts.len()]`. Cada descriptor aparece exactamente una
/// vez en la salida; los hosts sin unidades no se listan.
pub fn plan<H>(descriptors: &[UnitDescriptor], hosts: &[H]) -> Result<Vec<(H, Vec<UnitDescriptor>)>>
where
    H: Clone,
{
    if hosts.is_empty() {
        bail!("no hay hosts para desplegar {} unidades", descriptors.len());
    }

    let mut by_host: BTreeMap<usize, Vec<UnitDescriptor>> = BTreeMap::new();
    for descriptor in descriptors {
        let slot = descriptor.key.partition as usize % hosts.len();
        by_host.entry(slot).or_default().push(descriptor.clone());
    }

    Ok(by_host
        .into_iter()
        .map(|(slot, units)| (hosts[slot].clone(), units))
        .collect())
}
