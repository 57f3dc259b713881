use anyhow::{Context, Result};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, warn};

use crate::builder::{compile, UnitDescriptor};
use crate::bush::{Bush, Progress, TickUnit};
use crate::call::Value;
use crate::config::RuntimeConfig;
use crate::directory::Directory;
use crate::graph::{Graph, UnitKey};
use crate::pod::{Pod, PodSettings};
use crate::proxy::{input_stream, LocalCaller, ProxySettings, UnitCaller};
use crate::transforms::{ElementStream, StreamContext, TransformRegistry};

/// Unidad lista para entregar a un bush.
pub enum RuntimeUnit {
    Pod(Pod),
    Tick(Box<dyn TickUnit>),
}

/// Unidad tick que consume la cadena de un sink por lotes.
pub struct SinkUnit {
    key: UnitKey,
    stream: Option<ElementStream>,
    batch: u32,
    consumed: u64,
}

impl SinkUnit {
    pub fn new(key: UnitKey, stream: ElementStream, batch: u32) -> Self {
        Self {
            key,
            stream: Some(stream),
            batch: batch.max(1),
            consumed: 0,
        }
    }
}

impl TickUnit for SinkUnit {
    fn key(&self) -> UnitKey {
        self.key
    }

    fn step(&mut self) -> Result<Progress> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Progress::Done);
        };
        for _ in 0..self.batch {
            match stream.next() {
                Some(Ok(_)) => self.consumed += 1,
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(e.context(format!("sink {}", self.key)));
                }
                None => {
                    info!("sink {} terminó: {} elementos", self.key, self.consumed);
                    self.stream = None;
                    return Ok(Progress::Done);
                }
            }
        }
        Ok(Progress::More)
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

fn proxy_settings(config: &RuntimeConfig, sample_rate: f32) -> ProxySettings {
    ProxySettings {
        sample_rate,
        prefetch: config.prefetch,
        partition_size: config.partition_size,
    }
}

fn input_streams(
    descriptor: &UnitDescriptor,
    caller: &Arc<dyn UnitCaller>,
    settings: ProxySettings,
) -> Result<Vec<ElementStream>> {
    let mut proxies = descriptor.proxies.clone();
    proxies.sort_by_key(|p| p.slot);
    proxies
        .iter()
        .map(|p| input_stream(p, caller.clone(), settings))
        .collect()
}

/// Convierte un descriptor en una unidad ejecutable.
///
/// Los sinks quedan como unidades tick con la cadena ya armada; el resto son
/// pods cuya cadena (y sus proxies) se arma con el primer `open_cursor`.
pub fn instantiate(
    descriptor: &UnitDescriptor,
    registry: Arc<TransformRegistry>,
    caller: Arc<dyn UnitCaller>,
    config: &RuntimeConfig,
) -> Result<RuntimeUnit> {
    let ctx = StreamContext {
        partition: descriptor.key.partition,
        partition_count: descriptor.partition_count,
        partition_size: config.partition_size,
        sample_rate: config.sample_rate,
    };

    if descriptor.is_tick() {
        let inputs = input_streams(descriptor, &caller, proxy_settings(config, config.sample_rate))?;
        let stream = registry
            .build_chain(&descriptor.inner_nodes, ctx, inputs)
            .with_context(|| format!("armando el sink {}", descriptor.key))?;
        return Ok(RuntimeUnit::Tick(Box::new(SinkUnit::new(
            descriptor.key,
            stream,
            config.tick_batch,
        ))));
    }

    let settings = PodSettings {
        fan_out: descriptor.fan_out(),
        partition_size: config.partition_size,
        lock_timeout: config.lock_timeout(),
        readers: descriptor.readers.max(1),
    };
    let owned = descriptor.clone();
    let proxy_config = config.clone();
    let opener = Box::new(move |sample_rate: f32| {
        let inputs = input_streams(&owned, &caller, proxy_settings(&proxy_config, sample_rate))?;
        registry.build_chain(&owned.inner_nodes, StreamContext { sample_rate, ..ctx }, inputs)
    });
    Ok(RuntimeUnit::Pod(Pod::new(descriptor.key, opener, settings)))
}

/// Instancia y agrega al bush cada descriptor.
pub fn deploy(
    bush: &Bush,
    descriptors: &[UnitDescriptor],
    registry: &Arc<TransformRegistry>,
    caller: &Arc<dyn UnitCaller>,
    config: &RuntimeConfig,
) -> Result<()> {
    for descriptor in descriptors {
        match instantiate(descriptor, registry.clone(), caller.clone(), config)? {
            RuntimeUnit::Pod(pod) => {
                bush.add_pod(pod)?;
            }
            RuntimeUnit::Tick(unit) => bush.add_tick(unit)?,
        }
    }
    info!("bush {}: {} unidades desplegadas", bush.id(), descriptors.len());
    Ok(())
}

/// Resultado de una corrida local.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRun {
    pub units: usize,
    /// Lo que juntaron los sinks `collect`, por unidad.
    pub outputs: BTreeMap<UnitKey, Vec<Value>>,
}

/// Compila y ejecuta el grafo completo en un solo bush del proceso.
pub fn run_local(
    graph: &Graph,
    partitions: u32,
    registry: Arc<TransformRegistry>,
    config: &RuntimeConfig,
) -> Result<LocalRun> {
    let descriptors = compile(graph, partitions, registry.as_ref())?;

    let directory = Directory::new();
    let bush = Bush::new("local", config.pool_size, directory.clone())?;
    let caller: Arc<dyn UnitCaller> = Arc::new(LocalCaller::new(directory));

    if let Err(e) = deploy(&bush, &descriptors, &registry, &caller, config) {
        bush.close();
        return Err(e);
    }

    let mut first_fault = None;
    for future in bush.start() {
        let key = future.key();
        if let Err(fault) = future.wait() {
            warn!("unidad {key} falló: {fault}");
            first_fault.get_or_insert(fault);
        }
    }
    bush.close();

    if let Some(fault) = first_fault {
        return Err(anyhow::Error::new(fault).context("la corrida local falló"));
    }

    Ok(LocalRun {
        units: descriptors.len(),
        outputs: registry.outputs().take(),
    })
}
