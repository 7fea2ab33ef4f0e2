/*!
 * Compose manifest sanitization.
 *
 * User-supplied manifests are normalized before they ever reach the engine:
 * host paths are rebased under a per-deployment directory, host-port
 * bindings are stripped, privilege escalation vectors are removed, and
 * environment values are flattened to interpolation-safe strings. Running
 * the sanitizer twice yields byte-equal output.
 */

use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::OrchestratorResult;
use crate::types::OrganizationPlan;

/// Capabilities stripped from `cap_add` regardless of what the user asked
/// for.
const DANGEROUS_CAPS: &[&str] = &[
    "SYS_ADMIN",
    "NET_ADMIN",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_TIME",
    "MKNOD",
    "DAC_OVERRIDE",
];

/// Result of a sanitization pass: the canonical manifest plus the bind-mount
/// directories that must exist before the stack starts.
#[derive(Debug)]
pub struct SanitizedCompose {
    pub yaml: String,
    pub bind_directories: Vec<PathBuf>,
}

pub fn sanitize_compose(
    yaml: &str,
    deployment_id: &str,
    volume_base: &Path,
    plan: &OrganizationPlan,
    swarm_mode: bool,
    router_backed: bool,
) -> OrchestratorResult<SanitizedCompose> {
    let mut doc: Value = serde_yaml::from_str(yaml)?;
    let mut bind_directories = Vec::new();

    if let Some(services) = doc
        .as_mapping_mut()
        .and_then(|m| m.get_mut("services"))
        .and_then(Value::as_mapping_mut)
    {
        let names: Vec<String> = services
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect();
        for name in names {
            if let Some(service) = services.get_mut(name.as_str()).and_then(Value::as_mapping_mut)
            {
                sanitize_volumes(
                    service,
                    deployment_id,
                    &name,
                    volume_base,
                    &mut bind_directories,
                );
                sanitize_ports(service, router_backed);
                sanitize_security(service, &name);
                sanitize_environment(service);
                inject_plan_limits(service, plan, swarm_mode);
            }
        }
    }

    normalize_top_level_volumes(&mut doc, deployment_id, volume_base, &mut bind_directories);

    let rendered = serde_yaml::to_string(&doc)?;
    bind_directories.sort();
    bind_directories.dedup();
    Ok(SanitizedCompose {
        yaml: rendered,
        bind_directories,
    })
}

// ----------------------------------------------------------------------
// Volumes
// ----------------------------------------------------------------------

fn sanitize_volumes(
    service: &mut Mapping,
    deployment_id: &str,
    service_name: &str,
    volume_base: &Path,
    bind_directories: &mut Vec<PathBuf>,
) {
    let Some(volumes) = service.get_mut("volumes").and_then(Value::as_sequence_mut) else {
        return;
    };
    for entry in volumes.iter_mut() {
        match entry {
            Value::String(spec) => {
                *spec = rewrite_volume_spec(
                    spec,
                    deployment_id,
                    service_name,
                    volume_base,
                    bind_directories,
                );
            }
            Value::Mapping(long) => {
                rewrite_long_volume(
                    long,
                    deployment_id,
                    service_name,
                    volume_base,
                    bind_directories,
                );
            }
            _ => {}
        }
    }
}

/// Short volume syntax: `source:target[:mode]`, or a bare container path for
/// anonymous volumes (left untouched).
fn rewrite_volume_spec(
    spec: &str,
    deployment_id: &str,
    service_name: &str,
    volume_base: &Path,
    bind_directories: &mut Vec<PathBuf>,
) -> String {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    if parts.len() < 2 {
        return spec.to_string();
    }
    let source = parts[0];
    let rest = &parts[1..].join(":");

    let rebased = rebase_volume_source(source, deployment_id, service_name, volume_base);
    bind_directories.push(PathBuf::from(&rebased));
    format!("{}:{}", rebased, rest)
}

fn rewrite_long_volume(
    long: &mut Mapping,
    deployment_id: &str,
    service_name: &str,
    volume_base: &Path,
    bind_directories: &mut Vec<PathBuf>,
) {
    let source = long
        .get("source")
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(source) = source else {
        return;
    };
    let rebased = rebase_volume_source(&source, deployment_id, service_name, volume_base);
    bind_directories.push(PathBuf::from(&rebased));
    long.insert(
        Value::String("type".to_string()),
        Value::String("bind".to_string()),
    );
    long.insert(
        Value::String("source".to_string()),
        Value::String(rebased),
    );
}

/// Host paths are cleaned of traversal and rebased under
/// `<base>/<deployment>/<service>/<rel>`; named volumes become bind mounts
/// under `<base>/<deployment>/<name>`. Already-rebased sources are returned
/// unchanged so a second pass is a no-op.
fn rebase_volume_source(
    source: &str,
    deployment_id: &str,
    service_name: &str,
    volume_base: &Path,
) -> String {
    let deployment_root = volume_base.join(deployment_id);
    if Path::new(source).starts_with(&deployment_root) {
        return source.to_string();
    }

    let is_host_path = source.starts_with('/')
        || source.starts_with("./")
        || source.starts_with("../")
        || source.starts_with('~');
    if is_host_path {
        let rel = clean_relative_path(source);
        deployment_root
            .join(service_name)
            .join(rel)
            .to_string_lossy()
            .into_owned()
    } else {
        // Named volume.
        deployment_root
            .join(clean_relative_path(source))
            .to_string_lossy()
            .into_owned()
    }
}

/// Top-level named volume definitions follow the same scheme as the
/// service-level references: each becomes a local-driver bind onto
/// `<base>/<deployment_id>/<name>`.
fn normalize_top_level_volumes(
    doc: &mut Value,
    deployment_id: &str,
    volume_base: &Path,
    bind_directories: &mut Vec<PathBuf>,
) {
    let Some(volumes) = doc
        .as_mapping_mut()
        .and_then(|m| m.get_mut("volumes"))
        .and_then(Value::as_mapping_mut)
    else {
        return;
    };

    let names: Vec<String> = volumes
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect();
    for name in names {
        let device = volume_base
            .join(deployment_id)
            .join(clean_relative_path(&name))
            .to_string_lossy()
            .into_owned();
        bind_directories.push(PathBuf::from(&device));

        let mut driver_opts = Mapping::new();
        driver_opts.insert(
            Value::String("type".to_string()),
            Value::String("none".to_string()),
        );
        driver_opts.insert(
            Value::String("o".to_string()),
            Value::String("bind".to_string()),
        );
        driver_opts.insert(Value::String("device".to_string()), Value::String(device));

        let mut definition = Mapping::new();
        definition.insert(
            Value::String("driver".to_string()),
            Value::String("local".to_string()),
        );
        definition.insert(
            Value::String("driver_opts".to_string()),
            Value::Mapping(driver_opts),
        );
        volumes.insert(Value::String(name), Value::Mapping(definition));
    }
}

/// Strip `.`/`..` components and any leading slashes or tilde.
fn clean_relative_path(raw: &str) -> String {
    raw.trim_start_matches('~')
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect::<Vec<_>>()
        .join("/")
}

// ----------------------------------------------------------------------
// Ports
// ----------------------------------------------------------------------

fn sanitize_ports(service: &mut Mapping, router_backed: bool) {
    let Some(ports) = service.get_mut("ports").and_then(Value::as_sequence_mut) else {
        return;
    };

    let container_ports: Vec<String> = ports
        .iter()
        .filter_map(|entry| match entry {
            Value::String(spec) => Some(strip_host_binding(spec)),
            Value::Number(n) => Some(n.to_string()),
            Value::Mapping(long) => {
                let target = long.get("target").and_then(Value::as_u64)?;
                let protocol = long
                    .get("protocol")
                    .and_then(Value::as_str)
                    .filter(|p| *p != "tcp");
                Some(match protocol {
                    Some(protocol) => format!("{}/{}", target, protocol),
                    None => target.to_string(),
                })
            }
            _ => None,
        })
        .collect();

    if router_backed {
        // The edge router handles ingress; ports become internal-only.
        service.remove("ports");
        let expose = service
            .entry(Value::String("expose".to_string()))
            .or_insert_with(|| Value::Sequence(Vec::new()));
        if let Value::Sequence(expose_list) = expose {
            for port in container_ports {
                let value = Value::String(port);
                if !expose_list.contains(&value) {
                    expose_list.push(value);
                }
            }
        }
    } else {
        *ports = container_ports.into_iter().map(Value::String).collect();
    }
}

/// `[host_ip:]host_port:container_port[/proto]` -> `container_port[/proto]`.
fn strip_host_binding(spec: &str) -> String {
    let (ports, protocol) = match spec.split_once('/') {
        Some((ports, protocol)) => (ports, Some(protocol)),
        None => (spec, None),
    };
    let container = ports.rsplit(':').next().unwrap_or(ports);
    match protocol {
        Some(protocol) => format!("{}/{}", container, protocol),
        None => container.to_string(),
    }
}

// ----------------------------------------------------------------------
// Security
// ----------------------------------------------------------------------

fn sanitize_security(service: &mut Mapping, service_name: &str) {
    if service.get("network_mode").and_then(Value::as_str) == Some("host") {
        warn!("Removing host network mode from service '{}'", service_name);
        service.remove("network_mode");
    }

    if service.get("privileged").and_then(Value::as_bool) == Some(true) {
        warn!("Removing privileged flag from service '{}'", service_name);
        service.remove("privileged");
    }

    let empty_after_filter = if let Some(caps) =
        service.get_mut("cap_add").and_then(Value::as_sequence_mut)
    {
        caps.retain(|cap| {
            let Some(name) = cap.as_str() else {
                return false;
            };
            let normalized = name.trim_start_matches("CAP_").to_ascii_uppercase();
            let dangerous = DANGEROUS_CAPS.contains(&normalized.as_str());
            if dangerous {
                warn!(
                    "Stripping capability {} from service '{}'",
                    normalized, service_name
                );
            }
            !dangerous
        });
        caps.is_empty()
    } else {
        false
    };
    if empty_after_filter {
        service.remove("cap_add");
    }
}

// ----------------------------------------------------------------------
// Environment
// ----------------------------------------------------------------------

fn sanitize_environment(service: &mut Mapping) {
    let Some(env) = service.get_mut("environment") else {
        return;
    };

    let normalized: Mapping = match env {
        Value::Mapping(map) => map
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    Value::String(escape_interpolation(&scalar_to_string(v))),
                )
            })
            .collect(),
        Value::Sequence(entries) => entries
            .iter()
            .filter_map(|entry| entry.as_str())
            .map(|line| match line.split_once('=') {
                Some((key, value)) => (
                    Value::String(key.to_string()),
                    Value::String(escape_interpolation(value)),
                ),
                None => (Value::String(line.to_string()), Value::String(String::new())),
            })
            .collect(),
        _ => return,
    };
    *env = Value::Mapping(normalized);
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

/// Double every `$` so the engine never interpolates user secrets. Already
/// doubled dollars are preserved, which makes the escape idempotent.
pub fn escape_interpolation(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            if chars.peek() == Some(&'$') {
                chars.next();
            }
            out.push_str("$$");
        } else {
            out.push(c);
        }
    }
    out
}

// ----------------------------------------------------------------------
// Plan limits
// ----------------------------------------------------------------------

/// Inject organization plan caps as service resource limits. Larger existing
/// limits are capped down; smaller ones are kept.
fn inject_plan_limits(service: &mut Mapping, plan: &OrganizationPlan, swarm_mode: bool) {
    if plan.max_memory_bytes.is_none() && plan.max_cpu_cores.is_none() {
        return;
    }

    // Rebuild the nested limits structure from owned copies; this sidesteps
    // nested mutable borrows and keeps unrelated keys intact.
    let parent_key = if swarm_mode { Some("deploy") } else { None };
    let mut parent = match parent_key {
        Some(key) => service
            .get(key)
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default(),
        None => Mapping::new(),
    };
    let container = if parent_key.is_some() { &parent } else { &*service };

    let mut resources = container
        .get("resources")
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_default();
    let mut limits = resources
        .get("limits")
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_default();

    if let Some(max_memory) = plan.max_memory_bytes {
        let effective = match limits.get("memory").and_then(parse_memory_value) {
            Some(existing) if existing < max_memory => existing,
            _ => max_memory,
        };
        limits.insert(
            Value::String("memory".to_string()),
            Value::String(format_memory(effective)),
        );
    }
    if let Some(max_cores) = plan.max_cpu_cores {
        let effective = match limits.get("cpus").and_then(parse_cpus_value) {
            Some(existing) if existing < max_cores => existing,
            _ => max_cores,
        };
        limits.insert(
            Value::String("cpus".to_string()),
            Value::String(format_cpus(effective)),
        );
    }

    resources.insert(
        Value::String("limits".to_string()),
        Value::Mapping(limits),
    );
    match parent_key {
        Some(key) => {
            parent.insert(
                Value::String("resources".to_string()),
                Value::Mapping(resources),
            );
            service.insert(Value::String(key.to_string()), Value::Mapping(parent));
        }
        None => {
            service.insert(
                Value::String("resources".to_string()),
                Value::Mapping(resources),
            );
        }
    }
}

fn parse_memory_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_memory(s),
        _ => None,
    }
}

/// Parse `512M`, `2G`, `1024K`, plain byte counts, and the `b`/`ib`
/// suffix variants.
pub fn parse_memory(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(bytes) = trimmed.parse::<i64>() {
        return Some(bytes);
    }
    let lower = trimmed.to_ascii_lowercase();
    let numeric: String = lower
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let suffix = &lower[numeric.len()..];
    let value: f64 = numeric.parse().ok()?;
    let multiplier: f64 = match suffix.trim_end_matches("ib").trim_end_matches('b') {
        "k" => 1024.0,
        "m" => 1024.0 * 1024.0,
        "g" => 1024.0 * 1024.0 * 1024.0,
        "" => 1.0,
        _ => return None,
    };
    Some((value * multiplier) as i64)
}

/// Render bytes in the `M`/`G` notation compose expects.
pub fn format_memory(bytes: i64) -> String {
    const GIB: i64 = 1024 * 1024 * 1024;
    const MIB: i64 = 1024 * 1024;
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else {
        format!("{}M", (bytes + MIB - 1) / MIB)
    }
}

fn parse_cpus_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn format_cpus(cores: f64) -> String {
    if (cores - cores.round()).abs() < f64::EPSILON {
        format!("{}", cores.round() as i64)
    } else {
        format!("{}", cores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(memory: Option<i64>, cores: Option<f64>) -> OrganizationPlan {
        OrganizationPlan {
            organization_id: "org-1".to_string(),
            max_memory_bytes: memory,
            max_cpu_cores: cores,
            allow_inter_vm_communication: false,
        }
    }

    fn sanitize(yaml: &str, router_backed: bool) -> SanitizedCompose {
        sanitize_compose(
            yaml,
            "dep-1",
            Path::new("/var/lib/obiente/volumes"),
            &plan(None, None),
            false,
            router_backed,
        )
        .unwrap()
    }

    #[test]
    fn dangerous_caps_are_stripped_and_privileged_removed() {
        let yaml = r#"
services:
  app:
    image: nginx
    privileged: true
    network_mode: host
    cap_add:
      - SYS_ADMIN
      - NET_BIND_SERVICE
"#;
        let out = sanitize(yaml, false);
        let doc: Value = serde_yaml::from_str(&out.yaml).unwrap();
        let app = doc.get("services").unwrap().get("app").unwrap();
        assert!(app.get("privileged").is_none());
        assert!(app.get("network_mode").is_none());
        let caps = app.get("cap_add").unwrap().as_sequence().unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].as_str().unwrap(), "NET_BIND_SERVICE");
    }

    #[test]
    fn dollar_signs_are_doubled_once() {
        let yaml = r#"
services:
  app:
    image: postgres
    environment:
      DATABASE_URL: "postgresql://u:p@ss$word@h/db"
"#;
        let out = sanitize(yaml, false);
        let doc: Value = serde_yaml::from_str(&out.yaml).unwrap();
        let url = doc
            .get("services")
            .unwrap()
            .get("app")
            .unwrap()
            .get("environment")
            .unwrap()
            .get("DATABASE_URL")
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(url, "postgresql://u:p@ss$$word@h/db");
    }

    #[test]
    fn environment_scalars_become_strings() {
        let yaml = r#"
services:
  app:
    image: nginx
    environment:
      DEBUG: true
      WORKERS: 4
      EMPTY: null
"#;
        let out = sanitize(yaml, false);
        let doc: Value = serde_yaml::from_str(&out.yaml).unwrap();
        let env = doc
            .get("services")
            .unwrap()
            .get("app")
            .unwrap()
            .get("environment")
            .unwrap();
        assert_eq!(env.get("DEBUG").unwrap().as_str().unwrap(), "true");
        assert_eq!(env.get("WORKERS").unwrap().as_str().unwrap(), "4");
        assert_eq!(env.get("EMPTY").unwrap().as_str().unwrap(), "");
    }

    #[test]
    fn host_ports_are_stripped_and_router_demotes_to_expose() {
        let yaml = r#"
services:
  app:
    image: nginx
    ports:
      - "8080:80"
      - "9000:9000/tcp"
"#;
        let plain = sanitize(yaml, false);
        let doc: Value = serde_yaml::from_str(&plain.yaml).unwrap();
        let ports = doc
            .get("services")
            .unwrap()
            .get("app")
            .unwrap()
            .get("ports")
            .unwrap()
            .as_sequence()
            .unwrap();
        assert_eq!(ports[0].as_str().unwrap(), "80");
        assert_eq!(ports[1].as_str().unwrap(), "9000/tcp");

        let routed = sanitize(yaml, true);
        let doc: Value = serde_yaml::from_str(&routed.yaml).unwrap();
        let app = doc.get("services").unwrap().get("app").unwrap();
        assert!(app.get("ports").is_none());
        let expose = app.get("expose").unwrap().as_sequence().unwrap();
        assert_eq!(expose[0].as_str().unwrap(), "80");
        assert_eq!(expose[1].as_str().unwrap(), "9000/tcp");
    }

    #[test]
    fn volumes_are_rebased_under_deployment_root() {
        let yaml = r#"
services:
  app:
    image: nginx
    volumes:
      - "../etc/secrets:/config"
      - "data:/var/lib/data"
"#;
        let out = sanitize(yaml, false);
        let doc: Value = serde_yaml::from_str(&out.yaml).unwrap();
        let volumes = doc
            .get("services")
            .unwrap()
            .get("app")
            .unwrap()
            .get("volumes")
            .unwrap()
            .as_sequence()
            .unwrap();
        assert_eq!(
            volumes[0].as_str().unwrap(),
            "/var/lib/obiente/volumes/dep-1/app/etc/secrets:/config"
        );
        assert_eq!(
            volumes[1].as_str().unwrap(),
            "/var/lib/obiente/volumes/dep-1/data:/var/lib/data"
        );
        assert!(out
            .bind_directories
            .contains(&PathBuf::from("/var/lib/obiente/volumes/dep-1/data")));
    }

    #[test]
    fn top_level_volume_definitions_become_binds_under_deployment_root() {
        let yaml = r#"
services:
  app:
    image: nginx
    volumes:
      - "cache:/cache"
volumes:
  cache: {}
"#;
        let out = sanitize(yaml, false);
        let doc: Value = serde_yaml::from_str(&out.yaml).unwrap();
        let cache = doc.get("volumes").unwrap().get("cache").unwrap();
        assert_eq!(cache.get("driver").unwrap().as_str().unwrap(), "local");
        let opts = cache.get("driver_opts").unwrap();
        assert_eq!(opts.get("type").unwrap().as_str().unwrap(), "none");
        assert_eq!(opts.get("o").unwrap().as_str().unwrap(), "bind");
        assert_eq!(
            opts.get("device").unwrap().as_str().unwrap(),
            "/var/lib/obiente/volumes/dep-1/cache"
        );
        assert!(out
            .bind_directories
            .contains(&PathBuf::from("/var/lib/obiente/volumes/dep-1/cache")));
    }

    #[test]
    fn sanitize_twice_is_byte_equal() {
        let yaml = r#"
services:
  app:
    image: nginx
    privileged: true
    ports:
      - "8080:80"
    volumes:
      - "/host/data:/data"
      - "cache:/cache"
    environment:
      TOKEN: "se$cret"
      DEBUG: true
volumes:
  cache: {}
"#;
        let first = sanitize_compose(
            yaml,
            "dep-1",
            Path::new("/var/lib/obiente/volumes"),
            &plan(Some(512 * 1024 * 1024), Some(2.0)),
            false,
            true,
        )
        .unwrap();
        let second = sanitize_compose(
            &first.yaml,
            "dep-1",
            Path::new("/var/lib/obiente/volumes"),
            &plan(Some(512 * 1024 * 1024), Some(2.0)),
            false,
            true,
        )
        .unwrap();
        assert_eq!(first.yaml, second.yaml);
    }

    #[test]
    fn plan_limits_cap_down_but_keep_smaller() {
        let yaml = r#"
services:
  big:
    image: nginx
    resources:
      limits:
        memory: 4G
        cpus: "8"
  small:
    image: nginx
    resources:
      limits:
        memory: 128M
        cpus: "0.5"
"#;
        let out = sanitize_compose(
            yaml,
            "dep-1",
            Path::new("/var/lib/obiente/volumes"),
            &plan(Some(1024 * 1024 * 1024), Some(2.0)),
            false,
            false,
        )
        .unwrap();
        let doc: Value = serde_yaml::from_str(&out.yaml).unwrap();
        let limits = |service: &str| {
            doc.get("services")
                .unwrap()
                .get(service)
                .unwrap()
                .get("resources")
                .unwrap()
                .get("limits")
                .unwrap()
                .clone()
        };
        assert_eq!(limits("big").get("memory").unwrap().as_str().unwrap(), "1G");
        assert_eq!(limits("big").get("cpus").unwrap().as_str().unwrap(), "2");
        assert_eq!(
            limits("small").get("memory").unwrap().as_str().unwrap(),
            "128M"
        );
        assert_eq!(limits("small").get("cpus").unwrap().as_str().unwrap(), "0.5");
    }

    #[test]
    fn swarm_mode_places_limits_under_deploy() {
        let yaml = r#"
services:
  app:
    image: nginx
"#;
        let out = sanitize_compose(
            yaml,
            "dep-1",
            Path::new("/var/lib/obiente/volumes"),
            &plan(Some(256 * 1024 * 1024), None),
            true,
            false,
        )
        .unwrap();
        let doc: Value = serde_yaml::from_str(&out.yaml).unwrap();
        let memory = doc
            .get("services")
            .unwrap()
            .get("app")
            .unwrap()
            .get("deploy")
            .unwrap()
            .get("resources")
            .unwrap()
            .get("limits")
            .unwrap()
            .get("memory")
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(memory, "256M");
    }
}
