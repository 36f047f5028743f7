use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

use super::{Command, ExecutePayload, Fulfillment};
use crate::mqtt::MessageBridge;
use crate::registry::Device;

#[derive(Debug, Serialize)]
pub struct ExecuteResponsePayload {
    pub commands: Vec<CommandResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub ids: Vec<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

impl CommandResult {
    fn success(id: String) -> Self {
        Self { ids: vec![id], status: "SUCCESS", error_code: None }
    }

    fn error(id: String, code: &'static str) -> Self {
        Self { ids: vec![id], status: "ERROR", error_code: Some(code) }
    }
}

impl Fulfillment {
    /// EXECUTE : rend les templates et publie les commandes sur MQTT.
    /// Fan-out concurrent par appareil, jointure complète avant la réponse ;
    /// les commandes d'un même appareil partent séquentiellement, dans l'ordre.
    pub(super) async fn execute(&self, request_id: &str, payload: ExecutePayload) -> ExecuteResponsePayload {
        log::info!("handle execute request {request_id} ({} groups)", payload.commands.len());

        let mut commands = Vec::new();
        for group in payload.commands {
            let mut order: Vec<String> = Vec::new();
            let mut results: HashMap<String, CommandResult> = HashMap::new();
            let mut set = JoinSet::new();

            for device_ref in group.devices {
                let id = device_ref.id;
                order.push(id.clone());
                match self.registry.lookup(&id) {
                    None => {
                        results.insert(id.clone(), CommandResult::error(id, "deviceNotFound"));
                    }
                    Some(device) => {
                        let device = device.clone();
                        let execution = group.execution.clone();
                        let bridge = self.bridge.clone();
                        set.spawn(async move {
                            let outcome = execute_device(bridge, &device, &execution).await;
                            (device.id, outcome)
                        });
                    }
                }
            }

            while let Some(joined) = set.join_next().await {
                if let Ok((id, outcome)) = joined {
                    let result = match outcome {
                        Ok(()) => CommandResult::success(id.clone()),
                        Err(code) => CommandResult::error(id.clone(), code),
                    };
                    results.insert(id, result);
                }
            }

            // réponse dans l'ordre de la requête, un résultat par id demandé
            for id in order {
                let result = results
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| CommandResult::error(id, "transientError"));
                commands.push(result);
            }
        }

        ExecuteResponsePayload { commands }
    }
}

/// Publie chaque commande du groupe vers un appareil, dans l'ordre donné.
/// La première erreur arrête la séquence de cet appareil uniquement.
async fn execute_device(
    bridge: Arc<dyn MessageBridge>,
    device: &Device,
    execution: &[Command],
) -> Result<(), &'static str> {
    for command in execution {
        let Some(template) = device.executions.get(&command.name) else {
            log::warn!("device {} does not support {}", device.id, command.name);
            return Err("notSupported");
        };
        let payload = match render_template(template, &command.params) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("cannot render {} for {}: {e}", command.name, device.id);
                return Err("notSupported");
            }
        };
        if let Err(e) = bridge.publish(&device.command_topic, &payload).await {
            log::warn!("publish to {} failed: {e}", device.command_topic);
            return Err("transientError");
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum RenderError {
    #[error("missing parameter {{{0}}}")]
    MissingParam(String),
}

/// Substitue les placeholders {param} du template par les params de la commande
fn render_template(template: &str, params: &Map<String, Value>) -> Result<String, RenderError> {
    let mut rendered = template.to_string();
    for (key, value) in params {
        rendered = rendered.replace(&format!("{{{key}}}"), &render_value(value));
    }
    match find_placeholder(&rendered) {
        Some(missing) => Err(RenderError::MissingParam(missing)),
        None => Ok(rendered),
    }
}

/// Valeur rendue sans quotes parasites : le template choisit sa forme
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cherche un placeholder {ident} restant après substitution.
/// Les accolades JSON du template lui-même ne matchent pas (contenu non-identifiant).
fn find_placeholder(rendered: &str) -> Option<String> {
    let bytes = rendered.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            match rendered[i + 1..].find(['{', '}']) {
                Some(offset) => {
                    let end = i + 1 + offset;
                    if bytes[end] == b'}' && end > i + 1 {
                        let inner = &rendered[i + 1..end];
                        if inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                            return Some(inner.to_string());
                        }
                    }
                    i = end;
                    continue;
                }
                None => break,
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fulfillment_with, light_conf, registry_of, StubBridge};
    use super::super::{CommandGroup, DeviceRef, ExecutePayload};
    use super::*;
    use serde_json::json;

    fn on_off(on: bool) -> Command {
        let mut params = Map::new();
        params.insert("on".to_string(), json!(on));
        Command { name: "action.devices.commands.OnOff".to_string(), params }
    }

    fn group(ids: &[&str], execution: Vec<Command>) -> ExecutePayload {
        ExecutePayload {
            commands: vec![CommandGroup {
                devices: ids.iter().map(|id| DeviceRef { id: id.to_string() }).collect(),
                execution,
            }],
        }
    }

    #[test]
    fn render_substitutes_params() {
        let mut params = Map::new();
        params.insert("on".to_string(), json!(true));
        let rendered = render_template(r#"{"state": "{on}"}"#, &params).unwrap();
        assert_eq!(rendered, r#"{"state": "true"}"#);

        let mut params = Map::new();
        params.insert("color".to_string(), json!("red"));
        params.insert("brightness".to_string(), json!(80));
        let rendered = render_template(r#"{"color": "{color}", "bri": {brightness}}"#, &params).unwrap();
        assert_eq!(rendered, r#"{"color": "red", "bri": 80}"#);
    }

    #[test]
    fn render_fails_on_missing_param() {
        let err = render_template(r#"{"state": "{on}"}"#, &Map::new()).unwrap_err();
        assert!(matches!(err, RenderError::MissingParam(p) if p == "on"));
    }

    #[test]
    fn render_ignores_plain_json_braces() {
        let rendered = render_template(r#"{"nested": {"a": 1}}"#, &Map::new()).unwrap();
        assert_eq!(rendered, r#"{"nested": {"a": 1}}"#);
    }

    #[tokio::test]
    async fn execute_publishes_rendered_command() {
        let bridge = Arc::new(StubBridge::new());
        let f = fulfillment_with(bridge.clone(), registry_of(vec![("desk", light_conf("desk"))]));

        let payload = f.execute("r1", group(&["desk"], vec![on_off(true)])).await;

        assert_eq!(payload.commands.len(), 1);
        assert_eq!(payload.commands[0].status, "SUCCESS");
        assert_eq!(
            bridge.published(),
            vec![("home/desk/set".to_string(), r#"{"state": "true"}"#.to_string())]
        );
    }

    #[tokio::test]
    async fn execute_mixed_known_and_unknown_devices() {
        let bridge = Arc::new(StubBridge::new());
        let f = fulfillment_with(bridge.clone(), registry_of(vec![("d1", light_conf("d1"))]));

        let payload = f.execute("r1", group(&["d1", "d2"], vec![on_off(true)])).await;

        assert_eq!(payload.commands.len(), 2);
        assert_eq!(payload.commands[0].ids, vec!["d1".to_string()]);
        assert_eq!(payload.commands[0].status, "SUCCESS");
        assert_eq!(payload.commands[1].ids, vec!["d2".to_string()]);
        assert_eq!(payload.commands[1].status, "ERROR");
        assert_eq!(payload.commands[1].error_code, Some("deviceNotFound"));
        assert_eq!(bridge.published().len(), 1); // rien publié pour l'inconnu
    }

    #[tokio::test]
    async fn unsupported_command_only_fails_that_device() {
        let mut mute = light_conf("mute");
        mute.executions.clear(); // aucun template : commande non supportée
        let bridge = Arc::new(StubBridge::new());
        let f = fulfillment_with(
            bridge.clone(),
            registry_of(vec![("desk", light_conf("desk")), ("mute", mute)]),
        );

        let payload = f.execute("r1", group(&["desk", "mute"], vec![on_off(false)])).await;

        assert_eq!(payload.commands[0].status, "SUCCESS");
        assert_eq!(payload.commands[1].status, "ERROR");
        assert_eq!(payload.commands[1].error_code, Some("notSupported"));
        assert_eq!(bridge.published().len(), 1);
    }

    #[tokio::test]
    async fn missing_param_maps_to_not_supported() {
        let bridge = Arc::new(StubBridge::new());
        let f = fulfillment_with(bridge.clone(), registry_of(vec![("desk", light_conf("desk"))]));

        let command = Command { name: "action.devices.commands.OnOff".to_string(), params: Map::new() };
        let payload = f.execute("r1", group(&["desk"], vec![command])).await;

        assert_eq!(payload.commands[0].status, "ERROR");
        assert_eq!(payload.commands[0].error_code, Some("notSupported"));
        assert!(bridge.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_only_fails_that_device() {
        let bridge = Arc::new(StubBridge::new().failing_topic("home/flaky/set"));
        let f = fulfillment_with(
            bridge.clone(),
            registry_of(vec![("desk", light_conf("desk")), ("flaky", light_conf("flaky"))]),
        );

        let payload = f.execute("r1", group(&["desk", "flaky"], vec![on_off(true)])).await;

        assert_eq!(payload.commands[0].status, "SUCCESS");
        assert_eq!(payload.commands[1].status, "ERROR");
        assert_eq!(payload.commands[1].error_code, Some("transientError"));
    }

    #[tokio::test]
    async fn commands_for_one_device_are_published_in_order() {
        let bridge = Arc::new(StubBridge::new());
        let f = fulfillment_with(bridge.clone(), registry_of(vec![("desk", light_conf("desk"))]));

        let payload = f.execute("r1", group(&["desk"], vec![on_off(true), on_off(false)])).await;

        assert_eq!(payload.commands[0].status, "SUCCESS");
        let published: Vec<String> = bridge.published().into_iter().map(|(_, p)| p).collect();
        assert_eq!(published, vec![r#"{"state": "true"}"#.to_string(), r#"{"state": "false"}"#.to_string()]);
    }
}
