use crate::sandbox::EnvironmentSpec;
use anyhow::Result;
use oci_spec::runtime::*;
use std::collections::HashSet;
use std::path::Path;

/// Mount point of the candidate sources inside the environment (read-only).
pub const CONTAINER_WORKSPACE: &str = "/workspace";
/// Mount point of the writable log/output directory.
pub const CONTAINER_OUTPUT: &str = "/output";

/// uid/gid of the unprivileged user processes run as.
pub(crate) const NOBODY: u32 = 65534;

/// Builds the OCI runtime spec for one sandbox: hard resource caps, no
/// privileges, empty capability sets, read-only root, and a network namespace
/// unless the limits enable networking.
pub fn build_spec(env: &EnvironmentSpec, rootfs: &Path, keepalive: &[String]) -> Result<Spec> {
    let no_caps: HashSet<oci_spec::runtime::Capability> = HashSet::new();
    let capabilities = LinuxCapabilitiesBuilder::default()
        .bounding(no_caps.clone())
        .effective(no_caps.clone())
        .inheritable(no_caps.clone())
        .permitted(no_caps.clone())
        .ambient(no_caps)
        .build()?;

    let user = UserBuilder::default().uid(NOBODY).gid(NOBODY).build()?;

    let mut env_vars: Vec<String> = env
        .context
        .to_env()
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env_vars.push("PATH=/usr/local/bin:/usr/bin:/bin".to_string());
    env_vars.sort();

    let process = ProcessBuilder::default()
        .args(keepalive.to_vec())
        .env(env_vars)
        .cwd(CONTAINER_WORKSPACE)
        .terminal(false)
        .no_new_privileges(true)
        .capabilities(capabilities)
        .user(user)
        .build()?;

    let root = RootBuilder::default()
        .path(rootfs.to_path_buf())
        .readonly(true)
        .build()?;

    let mut namespace_types = vec![
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
    ];
    if !env.limits.network_enabled {
        namespace_types.push(LinuxNamespaceType::Network);
    }
    let namespaces = namespace_types
        .into_iter()
        .map(|typ| LinuxNamespaceBuilder::default().typ(typ).build())
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let memory_bytes = (env.limits.memory_mb * 1024 * 1024) as i64;
    let resources = LinuxResourcesBuilder::default()
        .memory(
            LinuxMemoryBuilder::default()
                .limit(memory_bytes)
                .swap(memory_bytes)
                .build()?,
        )
        .cpu(LinuxCpuBuilder::default().shares(env.limits.cpu_shares).build()?)
        .pids(
            LinuxPidsBuilder::default()
                .limit(env.limits.max_processes as i64)
                .build()?,
        )
        .build()?;

    let linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .resources(resources)
        .masked_paths(vec![
            "/proc/kcore".to_string(),
            "/proc/keys".to_string(),
            "/proc/timer_list".to_string(),
            "/sys/firmware".to_string(),
        ])
        .readonly_paths(vec![
            "/proc/bus".to_string(),
            "/proc/fs".to_string(),
            "/proc/irq".to_string(),
            "/proc/sys".to_string(),
            "/proc/sysrq-trigger".to_string(),
        ])
        .build()?;

    let disk_limit = format!("size={}m", env.limits.disk_mb);
    let mounts = vec![
        MountBuilder::default()
            .destination("/proc")
            .typ("proc")
            .source("proc")
            .build()?,
        MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec![
                "nosuid".to_string(),
                "strictatime".to_string(),
                "mode=755".to_string(),
                "size=65536k".to_string(),
            ])
            .build()?,
        MountBuilder::default()
            .destination("/tmp")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec![
                "nosuid".to_string(),
                "nodev".to_string(),
                "noexec".to_string(),
                disk_limit,
            ])
            .build()?,
        MountBuilder::default()
            .destination(CONTAINER_WORKSPACE)
            .typ("bind")
            .source(env.source_dir.clone())
            .options(vec!["rbind".to_string(), "ro".to_string()])
            .build()?,
        MountBuilder::default()
            .destination(CONTAINER_OUTPUT)
            .typ("bind")
            .source(env.output_dir.clone())
            .options(vec!["rbind".to_string(), "rw".to_string(), "noexec".to_string()])
            .build()?,
    ];

    let spec = SpecBuilder::default()
        .version("1.0.2")
        .hostname(env.name.clone())
        .process(process)
        .root(root)
        .linux(linux)
        .mounts(mounts)
        .build()?;

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ResourceLimits;
    use crate::security::IsolatedContext;

    fn env_spec(network: bool) -> EnvironmentSpec {
        let limits = ResourceLimits {
            network_enabled: network,
            memory_mb: 256,
            max_processes: 16,
            ..ResourceLimits::default()
        };
        EnvironmentSpec::new(
            "sbx-test",
            Path::new("/tmp/evoguard/sbx-test"),
            limits,
            IsolatedContext::minimal(),
        )
    }

    fn keepalive() -> Vec<String> {
        vec!["sleep".to_string(), "infinity".to_string()]
    }

    fn spec_json(network: bool) -> serde_json::Value {
        let spec = build_spec(&env_spec(network), Path::new("/rootfs"), &keepalive()).unwrap();
        serde_json::to_value(&spec).unwrap()
    }

    fn has_network_namespace(json: &serde_json::Value) -> bool {
        json["linux"]["namespaces"]
            .as_array()
            .unwrap()
            .iter()
            .any(|ns| ns["type"] == "network")
    }

    #[test]
    fn test_spec_drops_privileges() {
        let json = spec_json(false);
        assert_eq!(json["process"]["noNewPrivileges"], true);
        assert_eq!(json["process"]["user"]["uid"], 65534);
        assert_eq!(json["root"]["readonly"], true);
        let bounding = json["process"]["capabilities"]["bounding"].as_array();
        assert!(bounding.map(|caps| caps.is_empty()).unwrap_or(true));
    }

    #[test]
    fn test_spec_isolates_network_by_default() {
        assert!(has_network_namespace(&spec_json(false)));
        assert!(!has_network_namespace(&spec_json(true)));
    }

    #[test]
    fn test_network_grant_without_limit_keeps_namespace() {
        // The limits alone decide; a policy grant does not open the network
        let mut env = env_spec(false);
        env.context = IsolatedContext::minimal().grant(crate::security::Capability::Network);
        let spec = build_spec(&env, Path::new("/rootfs"), &keepalive()).unwrap();
        assert!(has_network_namespace(&serde_json::to_value(&spec).unwrap()));
    }

    #[test]
    fn test_spec_carries_resource_caps() {
        let json = spec_json(false);
        let resources = &json["linux"]["resources"];
        assert_eq!(resources["memory"]["limit"], 256 * 1024 * 1024);
        assert_eq!(resources["pids"]["limit"], 16);
        let workspace = json["mounts"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["destination"] == CONTAINER_WORKSPACE)
            .unwrap();
        assert!(workspace["options"]
            .as_array()
            .unwrap()
            .iter()
            .any(|o| o == "ro"));
    }
}
