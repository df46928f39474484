use serde::Deserialize;
use std::collections::BTreeMap;

use harbor_core::ContainerInfo;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    id: String,
    name: String,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    status: String,
    #[serde(default)]
    exit_code: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: BTreeMap<String, InspectNetwork>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Parse the output of `docker inspect --format '{{json .}}'`
pub(crate) fn parse_inspect(json: &str) -> Result<ContainerInfo, serde_json::Error> {
    let inspect: Inspect = serde_json::from_str(json)?;
    let exited = inspect.state.status == "exited" || inspect.state.status == "dead";

    Ok(ContainerInfo {
        id: inspect.id,
        name: inspect.name.trim_start_matches('/').to_string(),
        image: inspect.config.image,
        running: inspect.state.running,
        exit_code: exited.then_some(inspect.state.exit_code),
        ip_address: inspect
            .network_settings
            .networks
            .into_values()
            .map(|network| network.ip_address)
            .find(|ip| !ip.is_empty()),
    })
}
