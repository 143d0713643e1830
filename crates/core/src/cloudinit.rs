//! Cloud-init document builders.
//!
//! Every instance gets a meta-data and a vendor-data document; a network
//! configuration is emitted only when some extra interface wants automatic
//! configuration. Client-supplied user-data is post-processed so the default
//! user and our authorized key survive custom `users:`/`ssh_authorized_keys:`
//! sections.

use multipassd_backend::SshKeyProvider;
use multipassd_common::{NetworkInterface, Result};
use serde_yaml::{Mapping, Value};

const BASE_CLOUD_INIT_CONFIG: &str = r#"
growpart:
  mode: auto
  devices: ["/"]
  ignore_growroot_disabled: false
users:
  - default
manage_etc_hosts: true
"#;

fn key(s: &str) -> Value {
    Value::String(s.to_string())
}

fn entry<'a>(map: &'a mut Mapping, name: &str) -> &'a mut Value {
    map.entry(key(name))
        .or_insert_with(|| Value::Mapping(Mapping::new()))
}

/// The meta-data document: identity of the instance.
pub fn make_cloud_init_meta_config(name: &str) -> Value {
    let mut meta = Mapping::new();
    meta.insert(key("instance-id"), key(name));
    meta.insert(key("local-hostname"), key(name));
    meta.insert(key("cloud-name"), key("multipass"));
    Value::Mapping(meta)
}

/// The vendor-data document: authorized key, timezone, default user and the
/// pollinate user-agent file.
pub fn make_cloud_init_vendor_config(
    key_provider: &dyn SshKeyProvider,
    time_zone: &str,
    username: &str,
    backend_version_string: &str,
    image: &str,
    remote_name: &str,
) -> Result<Value> {
    let ssh_key_line = format!(
        "ssh-rsa {} {}@localhost",
        key_provider.public_key_as_base64(),
        username
    );

    let pollinate_alias = if image.is_empty() {
        "default"
    } else if image.starts_with("http") {
        "http"
    } else if image.starts_with("file") {
        "file"
    } else {
        image
    };

    let mut config: Value = serde_yaml::from_str(BASE_CLOUD_INIT_CONFIG)?;
    let map = config.as_mapping_mut().expect("base config is a mapping");

    map.entry(key("ssh_authorized_keys"))
        .or_insert_with(|| Value::Sequence(vec![]))
        .as_sequence_mut()
        .expect("ssh_authorized_keys is a sequence")
        .push(key(&ssh_key_line));

    map.insert(key("timezone"), key(time_zone));

    let system_info = entry(map, "system_info");
    let default_user = entry(
        system_info.as_mapping_mut().expect("mapping"),
        "default_user",
    );
    default_user
        .as_mapping_mut()
        .expect("mapping")
        .insert(key("name"), key(username));

    let mut user_agent = format!(
        "multipass/version/{} # written by Multipass\n",
        crate::VERSION
    );
    user_agent += &format!(
        "multipass/driver/{} # written by Multipass\n",
        backend_version_string
    );
    user_agent += &format!(
        "multipass/host/{}-{} # written by Multipass\n",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    user_agent += &format!(
        "multipass/alias/{}{} # written by Multipass\n",
        if remote_name.is_empty() {
            String::new()
        } else {
            format!("{}:", remote_name)
        },
        pollinate_alias
    );

    let mut pollinate_file = Mapping::new();
    pollinate_file.insert(key("path"), key("/etc/pollinate/add-user-agent"));
    pollinate_file.insert(key("content"), key(&user_agent));

    map.entry(key("write_files"))
        .or_insert_with(|| Value::Sequence(vec![]))
        .as_sequence_mut()
        .expect("write_files is a sequence")
        .push(Value::Mapping(pollinate_file));

    Ok(config)
}

/// The network configuration document, or `Value::Null` when no extra
/// interface wants automatic configuration.
pub fn make_cloud_init_network_config(
    default_mac_address: &str,
    extra_interfaces: &[NetworkInterface],
) -> Value {
    if !extra_interfaces.iter().any(|iface| iface.auto_mode) {
        return Value::Null;
    }

    let mut ethernets = Mapping::new();

    let mut default_match = Mapping::new();
    default_match.insert(key("macaddress"), key(default_mac_address));
    let mut default_eth = Mapping::new();
    default_eth.insert(key("match"), Value::Mapping(default_match));
    default_eth.insert(key("dhcp4"), Value::Bool(true));
    ethernets.insert(key("default"), Value::Mapping(default_eth));

    for (i, iface) in extra_interfaces.iter().enumerate() {
        if !iface.auto_mode {
            continue;
        }
        let mut iface_match = Mapping::new();
        iface_match.insert(key("macaddress"), key(&iface.mac_address));

        // The default gateway stays with the first interface.
        let mut overrides = Mapping::new();
        overrides.insert(key("route-metric"), Value::Number(200.into()));

        let mut eth = Mapping::new();
        eth.insert(key("match"), Value::Mapping(iface_match));
        eth.insert(key("dhcp4"), Value::Bool(true));
        eth.insert(key("dhcp4-overrides"), Value::Mapping(overrides));
        // Optional, so networkd does not wait for the device to be configured.
        eth.insert(key("optional"), Value::Bool(true));

        ethernets.insert(key(&format!("extra{}", i)), Value::Mapping(eth));
    }

    let mut network = Mapping::new();
    network.insert(key("version"), Value::Number(2.into()));
    network.insert(key("ethernets"), Value::Mapping(ethernets));
    Value::Mapping(network)
}

/// Post-process client user-data: keep the default user in custom `users:`
/// sequences and re-append our authorized key to custom
/// `ssh_authorized_keys:` sequences.
pub fn prepare_user_data(user_data: &mut Value, vendor_config: &Value) {
    let Some(map) = user_data.as_mapping_mut() else {
        return;
    };

    if let Some(users) = map.get_mut(&key("users")).and_then(Value::as_sequence_mut) {
        users.push(key("default"));
    }

    if let Some(keys) = map
        .get_mut(&key("ssh_authorized_keys"))
        .and_then(Value::as_sequence_mut)
    {
        if let Some(vendor_key) = vendor_config
            .get("ssh_authorized_keys")
            .and_then(|v| v.get(0))
        {
            keys.push(vendor_key.clone());
        }
    }
}
