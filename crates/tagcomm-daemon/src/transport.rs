//! Transport construction from the `[transport]` section.

use anyhow::{Context, Result};
use std::sync::Arc;
use tagcomm_codec::{byte_len, resolve_bit_size_str};
use tagcomm_common::{CommConfig, TagDefinition, TransportDriver};
use tagcomm_transport::{AdsTransport, SimulatedPlc};
use tracing::{debug, info, warn};

/// Build the transport selected by the configuration.
pub fn create_transport(config: &CommConfig) -> Result<Arc<dyn AdsTransport>> {
    match config.transport.driver {
        TransportDriver::Simulated => {
            let plc = simulated_plc(config)?;
            info!(
                ams_net_id = %config.transport.ams_net_id,
                port = config.transport.port,
                "Using simulated PLC"
            );
            Ok(Arc::new(plc))
        }
    }
}

/// Simulated runtime exposing one symbol per configured tag.
///
/// Struct tags get one aliasing member symbol per declared field.
fn simulated_plc(config: &CommConfig) -> Result<SimulatedPlc> {
    let plc = SimulatedPlc::new(config.transport.port);
    for def in &config.tags {
        let path = symbol_path(def);
        if def.fields.is_empty() {
            let size = symbol_size(&def.data_type, def.bit_size)
                .with_context(|| format!("Cannot size tag {path}"))?;
            if size == 0 {
                warn!(tag = %path, data_type = %def.data_type, "Tag has no fixed size, not exported");
                continue;
            }
            plc.define_symbol(&path, size);
            debug!(tag = %path, size, "Exported simulated symbol");
        } else {
            let fields = def
                .fields
                .iter()
                .map(|f| {
                    symbol_size(&f.data_type, None)
                        .map(|size| (f.name.as_str(), size))
                        .with_context(|| format!("Cannot size field {path}.{}", f.name))
                })
                .collect::<Result<Vec<_>>>()?;
            plc.define_struct(&path, &fields);
            debug!(tag = %path, fields = fields.len(), "Exported simulated struct");
        }
    }
    Ok(plc)
}

fn symbol_path(def: &TagDefinition) -> String {
    if def.scope.is_empty() {
        def.name.clone()
    } else {
        format!("{}.{}", def.scope, def.name)
    }
}

fn symbol_size(data_type: &str, bit_size: Option<i64>) -> Result<usize> {
    let bits = match bit_size {
        Some(bits) => bits,
        None => resolve_bit_size_str(data_type, None)?,
    };
    Ok(byte_len(bits))
}
