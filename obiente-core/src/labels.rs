/*!
 * Label rendering.
 *
 * Every managed entity carries the management label set; router-backed
 * services additionally carry traefik labels derived from their routings.
 * Rendering is idempotent: existing router labels are stripped before a
 * re-render so re-deploys never accumulate stale rules.
 */

use serde_yaml::Value;
use std::collections::HashMap;

use crate::types::{DeploymentRouting, RoutingProtocol};

pub const MANAGED_LABEL: &str = "obiente.managed";
pub const DEPLOYMENT_ID_LABEL: &str = "obiente.deployment_id";
pub const SERVICE_NAME_LABEL: &str = "obiente.service_name";
pub const REPLICA_LABEL: &str = "obiente.replica";
pub const DOMAIN_LABEL: &str = "obiente.domain";
pub const TRAEFIK_FLAG_LABEL: &str = "obiente.traefik";

/// Engine label identifying the compose project of a container.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Sentinel cert resolver for router-internal certificates: maps the router
/// back to the plain entrypoint instead of naming a resolver.
const INTERNAL_RESOLVER: &str = "internal";

/// The management label set stamped on every managed entity.
pub fn management_labels(
    deployment_id: &str,
    service: &str,
    replica: u32,
    domain: &str,
    has_routing: bool,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(DEPLOYMENT_ID_LABEL.to_string(), deployment_id.to_string());
    labels.insert(SERVICE_NAME_LABEL.to_string(), service.to_string());
    labels.insert(REPLICA_LABEL.to_string(), replica.to_string());
    labels.insert(DOMAIN_LABEL.to_string(), domain.to_string());
    if has_routing {
        labels.insert(TRAEFIK_FLAG_LABEL.to_string(), "true".to_string());
    }
    labels
}

/// Render the traefik labels for one service's routings. Returns an empty
/// map when the service has no routing (the edge router then ignores it).
pub fn router_labels(
    deployment_id: &str,
    service: &str,
    routings: &[DeploymentRouting],
) -> HashMap<String, String> {
    let service_routings: Vec<&DeploymentRouting> = routings
        .iter()
        .filter(|r| r.matches_service(service))
        .collect();
    if service_routings.is_empty() {
        return HashMap::new();
    }

    let mut labels = HashMap::new();
    labels.insert("traefik.enable".to_string(), "true".to_string());

    for (index, routing) in service_routings.iter().enumerate() {
        let router = router_name(deployment_id, routing, index);

        let mut rule = format!("Host(`{}`)", routing.domain);
        if let Some(path) = routing.path_prefix.as_deref().filter(|p| !p.is_empty()) {
            rule.push_str(&format!(" && PathPrefix(`{}`)", path));
        }
        labels.insert(format!("traefik.http.routers.{}.rule", router), rule);

        let secure = routing.protocol == RoutingProtocol::Https
            || (routing.protocol != RoutingProtocol::Http && routing.ssl_enabled);
        let resolver = routing
            .ssl_cert_resolver
            .as_deref()
            .filter(|r| !r.is_empty());
        let entrypoint = if resolver == Some(INTERNAL_RESOLVER) {
            "web"
        } else if secure {
            "websecure"
        } else {
            "web"
        };
        labels.insert(
            format!("traefik.http.routers.{}.entrypoints", router),
            entrypoint.to_string(),
        );
        if entrypoint == "websecure" {
            labels.insert(format!("traefik.http.routers.{}.tls", router), "true".to_string());
            if let Some(resolver) = resolver {
                labels.insert(
                    format!("traefik.http.routers.{}.tls.certresolver", router),
                    resolver.to_string(),
                );
            }
        }

        labels.insert(
            format!("traefik.http.routers.{}.service", router),
            router.clone(),
        );
        labels.insert(
            format!("traefik.http.services.{}.loadbalancer.server.port", router),
            routing.target_port.to_string(),
        );

        if let Some(middlewares) = middleware_labels(&router, &routing.middleware) {
            labels.extend(middlewares);
        }
    }
    labels
}

/// Flatten the routing's middleware document into traefik middleware labels
/// and attach the chain to the router.
fn middleware_labels(
    router: &str,
    middleware: &serde_json::Value,
) -> Option<HashMap<String, String>> {
    let object = middleware.as_object()?;
    if object.is_empty() {
        return None;
    }
    let mut labels = HashMap::new();
    let mut names: Vec<String> = Vec::new();
    for (name, config) in object {
        names.push(name.clone());
        if let Some(config) = config.as_object() {
            for (key, value) in config {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                labels.insert(
                    format!("traefik.http.middlewares.{}.{}", name, key),
                    rendered,
                );
            }
        }
    }
    labels.insert(
        format!("traefik.http.routers.{}.middlewares", router),
        names.join(","),
    );
    Some(labels)
}

/// Router key for one routing: the deployment id for the primary service,
/// suffixed with the service name otherwise, and with the routing index when
/// a service carries more than one routing.
fn router_name(deployment_id: &str, routing: &DeploymentRouting, index: usize) -> String {
    let primary = routing.service_name.is_empty() || routing.service_name == "default";
    let mut name = if primary {
        sanitize_key(deployment_id)
    } else {
        format!(
            "{}-{}",
            sanitize_key(deployment_id),
            sanitize_key(&routing.service_name)
        )
    };
    if index > 0 {
        name.push_str(&format!("-{}", index));
    }
    name
}

fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Drop previously-rendered router and loadbalancer labels so a re-render
/// starts clean.
pub fn strip_router_labels(labels: &mut HashMap<String, String>) {
    labels.retain(|key, _| !key.starts_with("traefik."));
}

/// Merge a label set into a compose service node. Existing labels (list or
/// map form) are normalized to map form, stale router labels are stripped,
/// and the result lands under `deploy.labels` in swarm mode or the
/// service-level `labels` key otherwise.
pub fn apply_labels_to_service(
    service: &mut Value,
    labels: &HashMap<String, String>,
    swarm_mode: bool,
) {
    let Value::Mapping(service_map) = service else {
        return;
    };

    let mut merged = labels_node_of(service_map, swarm_mode)
        .map(labels_value_to_map)
        .unwrap_or_default();
    strip_router_labels(&mut merged);
    for (key, value) in labels {
        merged.insert(key.clone(), value.clone());
    }

    let mut sorted: Vec<(&String, &String)> = merged.iter().collect();
    sorted.sort();
    let mut rendered = serde_yaml::Mapping::new();
    for (key, value) in sorted {
        rendered.insert(
            Value::String(key.clone()),
            Value::String(value.clone()),
        );
    }

    if swarm_mode {
        let deploy = service_map
            .entry(Value::String("deploy".to_string()))
            .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
        if let Value::Mapping(deploy_map) = deploy {
            deploy_map.insert(
                Value::String("labels".to_string()),
                Value::Mapping(rendered),
            );
        }
        // A previously-rendered direct-mode label set would shadow the
        // deploy-level one on re-deploys under swarm.
        service_map.remove("labels");
    } else {
        service_map.insert(
            Value::String("labels".to_string()),
            Value::Mapping(rendered),
        );
    }
}

fn labels_node_of(service_map: &serde_yaml::Mapping, swarm_mode: bool) -> Option<&Value> {
    if swarm_mode {
        service_map
            .get("deploy")
            .and_then(|d| d.get("labels"))
            .or_else(|| service_map.get("labels"))
    } else {
        service_map.get("labels")
    }
}

/// Accept both compose label forms: `- key=value` lists and `key: value`
/// maps.
fn labels_value_to_map(value: &Value) -> HashMap<String, String> {
    let mut out = HashMap::new();
    match value {
        Value::Sequence(entries) => {
            for entry in entries {
                if let Value::String(s) = entry {
                    match s.split_once('=') {
                        Some((k, v)) => out.insert(k.to_string(), v.to_string()),
                        None => out.insert(s.clone(), String::new()),
                    };
                }
            }
        }
        Value::Mapping(map) => {
            for (k, v) in map {
                let key = match k {
                    Value::String(s) => s.clone(),
                    other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
                };
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Null => String::new(),
                    other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
                };
                out.insert(key, rendered);
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn routing(service: &str, port: u16, protocol: RoutingProtocol) -> DeploymentRouting {
        let now = Utc::now();
        DeploymentRouting {
            id: "r1".to_string(),
            deployment_id: "d1".to_string(),
            service_name: service.to_string(),
            domain: "d1.example.com".to_string(),
            path_prefix: None,
            target_port: port,
            protocol,
            ssl_enabled: false,
            ssl_cert_resolver: None,
            middleware: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn primary_service_renders_expected_labels() {
        let labels = router_labels("d1", "default", &[routing("default", 8080, RoutingProtocol::Http)]);
        assert_eq!(labels.get("traefik.enable").unwrap(), "true");
        assert_eq!(
            labels.get("traefik.http.routers.d1.rule").unwrap(),
            "Host(`d1.example.com`)"
        );
        assert_eq!(labels.get("traefik.http.routers.d1.entrypoints").unwrap(), "web");
        assert_eq!(
            labels
                .get("traefik.http.services.d1.loadbalancer.server.port")
                .unwrap(),
            "8080"
        );
    }

    #[test]
    fn https_routing_uses_websecure_and_resolver() {
        let mut r = routing("default", 443, RoutingProtocol::Https);
        r.ssl_cert_resolver = Some("letsencrypt".to_string());
        let labels = router_labels("d1", "default", &[r]);
        assert_eq!(
            labels.get("traefik.http.routers.d1.entrypoints").unwrap(),
            "websecure"
        );
        assert_eq!(
            labels
                .get("traefik.http.routers.d1.tls.certresolver")
                .unwrap(),
            "letsencrypt"
        );
    }

    #[test]
    fn internal_resolver_maps_back_to_web() {
        let mut r = routing("default", 443, RoutingProtocol::Https);
        r.ssl_cert_resolver = Some("internal".to_string());
        let labels = router_labels("d1", "default", &[r]);
        assert_eq!(labels.get("traefik.http.routers.d1.entrypoints").unwrap(), "web");
        assert!(labels
            .get("traefik.http.routers.d1.tls.certresolver")
            .is_none());
    }

    #[test]
    fn path_prefix_lands_in_rule() {
        let mut r = routing("default", 80, RoutingProtocol::Http);
        r.path_prefix = Some("/api".to_string());
        let labels = router_labels("d1", "default", &[r]);
        assert_eq!(
            labels.get("traefik.http.routers.d1.rule").unwrap(),
            "Host(`d1.example.com`) && PathPrefix(`/api`)"
        );
    }

    #[test]
    fn no_routing_renders_nothing() {
        let labels = router_labels("d1", "worker", &[]);
        assert!(labels.is_empty());
    }

    #[test]
    fn rerender_is_idempotent() {
        let routings = vec![routing("default", 8080, RoutingProtocol::Http)];
        let mut labels = router_labels("d1", "default", &routings);
        labels.extend(management_labels("d1", "default", 0, "d1.example.com", true));

        let before = labels.clone();
        strip_router_labels(&mut labels);
        labels.extend(router_labels("d1", "default", &routings));
        assert_eq!(before, labels);
    }

    #[test]
    fn compose_service_labels_land_under_deploy_in_swarm_mode() {
        let mut service: Value = serde_yaml::from_str("image: nginx\n").unwrap();
        let labels = management_labels("d1", "web", 0, "d1.example.com", false);
        apply_labels_to_service(&mut service, &labels, true);
        let deploy_labels = service
            .get("deploy")
            .and_then(|d| d.get("labels"))
            .unwrap();
        assert_eq!(
            deploy_labels.get("obiente.managed").unwrap().as_str().unwrap(),
            "true"
        );
    }

    #[test]
    fn list_form_labels_are_normalized() {
        let mut service: Value =
            serde_yaml::from_str("image: nginx\nlabels:\n  - app=legacy\n  - traefik.enable=true\n")
                .unwrap();
        apply_labels_to_service(&mut service, &HashMap::new(), false);
        let labels = service.get("labels").unwrap();
        assert_eq!(labels.get("app").unwrap().as_str().unwrap(), "legacy");
        // Stale router labels are stripped on re-render.
        assert!(labels.get("traefik.enable").is_none());
    }
}
