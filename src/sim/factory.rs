use log::info;
use phf::phf_map;

use crate::base::error::{SimError, SimResult};
use crate::cmp::dbi::DbiCache;
use crate::cmp::dcp::DcpCache;
use crate::cmp::dram::DramController;
use crate::cmp::mshr::Mshr;
use crate::cmp::stall::Stall;
use crate::cmp::stream::StreamPrefetcher;
use crate::cmp::stride::StridePrefetcher;
use crate::cmp::vts::VtsCache;
use crate::sim::component::Component;
use crate::sim::config::{HierarchyConfig, StageSpec};
use crate::sim::hierarchy::Hierarchy;

type Builder = fn(String, &StageSpec) -> SimResult<Box<dyn Component>>;

fn stall(name: String, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    Ok(Box::new(Stall::new(name, spec.params()?)))
}

fn mshr(name: String, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    Ok(Box::new(Mshr::new(name, spec.params()?)?))
}

fn stride(name: String, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    Ok(Box::new(StridePrefetcher::new(name, spec.params()?)?))
}

fn stream(name: String, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    Ok(Box::new(StreamPrefetcher::new(name, spec.params()?)?))
}

fn dcp(name: String, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    Ok(Box::new(DcpCache::new(name, spec.params()?)?))
}

fn dbi(name: String, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    Ok(Box::new(DbiCache::new(name, spec.params()?)?))
}

fn vts(name: String, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    Ok(Box::new(VtsCache::new(name, spec.params()?)?))
}

fn dram(name: String, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    Ok(Box::new(DramController::new(name, spec.params()?)?))
}

static COMPONENTS: phf::Map<&'static str, Builder> = phf_map! {
    "stall" => stall,
    "mshr" => mshr,
    "stride-prefetcher" => stride,
    "stream-prefetcher" => stream,
    "dcp-llc" => dcp,
    "dbi-llc" => dbi,
    "vts-llc" => vts,
    "dram" => dram,
};

/// Instantiate the component for stage `index`. Unnamed stages are called `<kind>-<index>`.
pub fn build_component(index: usize, spec: &StageSpec) -> SimResult<Box<dyn Component>> {
    let build = COMPONENTS
        .get(spec.kind.as_str())
        .ok_or_else(|| SimError::UnknownComponent(spec.kind.clone()))?;
    let name = spec
        .name
        .clone()
        .unwrap_or_else(|| format!("{}-{}", spec.kind, index));
    build(name, spec)
}

pub fn build_hierarchy(config: &HierarchyConfig) -> SimResult<Hierarchy> {
    let components = config
        .stages
        .iter()
        .enumerate()
        .map(|(i, spec)| build_component(i, spec))
        .collect::<SimResult<Vec<_>>>()?;
    info!(
        "built hierarchy: {}",
        config
            .stages
            .iter()
            .map(|s| s.kind.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    Hierarchy::new(config.sim.clone(), components)
}
