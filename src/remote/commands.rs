//! Ordered command assembly for node provisioning
//!
//! Pure functions that turn an OS family into the exact command sequences
//! for installation, uninstallation, and reconfiguration. Two OS families
//! are supported with fixed templates; Ubuntu and Debian share the
//! debian-family template and differ only in the container-runtime package
//! source. Anything else is an unknown OS and a hard installation error.

/// Operating system of a contributed machine, probed from `/etc/os-release`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsFamily {
    /// Ubuntu (debian family, distro-packaged container runtime)
    Ubuntu,
    /// Debian (debian family, upstream container-runtime repository)
    Debian,
    /// CentOS (rpm family)
    Centos,
}

/// Parse the output of `cat /etc/os-release` into an OS family
///
/// Returns `None` for anything outside the supported families.
pub fn detect_os(os_release: &[u8]) -> Option<OsFamily> {
    let text = String::from_utf8_lossy(os_release);
    let id = text
        .lines()
        .find_map(|line| line.strip_prefix("ID="))
        .map(|v| v.trim().trim_matches('"'))?;
    match id {
        "ubuntu" => Some(OsFamily::Ubuntu),
        "debian" => Some(OsFamily::Debian),
        "centos" => Some(OsFamily::Centos),
        _ => None,
    }
}

/// Commands that install the container runtime, the node agent, and join
/// the machine to the cluster
///
/// The sequence assumes root privileges and a freshly uninstalled machine:
/// kernel module and sysctl setup for bridged networking, swap disabling,
/// package repository configuration, pinned package installation, hostname
/// assignment, runtime and kubelet start, and finally the join command
/// carrying the short-lived token.
pub fn install_commands(
    os: OsFamily,
    hostname: &str,
    kubernetes_version: &str,
    join_command: &str,
) -> Vec<String> {
    match os {
        OsFamily::Ubuntu | OsFamily::Debian => {
            let runtime_install = match os {
                OsFamily::Ubuntu => vec![format!(
                    "apt-get install docker.io kubeadm={v}-00 kubectl={v}-00 kubelet={v}-00 kubernetes-cni -y",
                    v = kubernetes_version
                )],
                _ => vec![
                    "apt-get install software-properties-common -y".to_string(),
                    "curl -fsSL https://download.docker.com/linux/debian/gpg | sudo apt-key add -"
                        .to_string(),
                    "add-apt-repository \"deb [arch=amd64] https://download.docker.com/linux/debian $(lsb_release -cs) stable\""
                        .to_string(),
                    "apt-get update".to_string(),
                    format!(
                        "apt-get install docker-ce kubeadm={v}-00 kubectl={v}-00 kubelet={v}-00 kubernetes-cni -y",
                        v = kubernetes_version
                    ),
                ],
            };

            let mut commands = vec![
                "dpkg --configure -a".to_string(),
                "apt-get update -y && apt-get install -y apt-transport-https -y".to_string(),
                "apt-get install curl -y".to_string(),
                "modprobe br_netfilter".to_string(),
                "cat <<EOF > /etc/sysctl.d/k8s.conf".to_string(),
                "net.bridge.bridge-nf-call-ip6tables = 1".to_string(),
                "net.bridge.bridge-nf-call-iptables = 1".to_string(),
                "EOF".to_string(),
                "sysctl --system".to_string(),
                "swapoff -a".to_string(),
                "sed -e '/swap/ s/^#*/#/' -i /etc/fstab".to_string(),
                "curl -s https://packages.cloud.google.com/apt/doc/apt-key.gpg | apt-key add -"
                    .to_string(),
                "cat <<EOF | tee /etc/apt/sources.list.d/kubernetes.list".to_string(),
                "deb https://apt.kubernetes.io/ kubernetes-xenial main".to_string(),
                "EOF".to_string(),
                "apt-get update".to_string(),
            ];
            commands.extend(runtime_install);
            commands.extend([
                "apt-mark hold kubelet kubeadm kubectl".to_string(),
                format!("hostname {hostname}"),
                "systemctl enable docker".to_string(),
                "systemctl start docker".to_string(),
                join_command.to_string(),
                "systemctl daemon-reload".to_string(),
                "systemctl restart kubelet".to_string(),
            ]);
            commands
        }
        OsFamily::Centos => vec![
            "yum install yum-utils -y".to_string(),
            "yum install epel-release -y".to_string(),
            "yum update -y".to_string(),
            "modprobe br_netfilter".to_string(),
            "cat <<EOF > /etc/sysctl.d/k8s.conf".to_string(),
            "net.bridge.bridge-nf-call-ip6tables = 1".to_string(),
            "net.bridge.bridge-nf-call-iptables = 1".to_string(),
            "EOF".to_string(),
            "sysctl --system".to_string(),
            "swapoff -a".to_string(),
            "sed -e '/swap/ s/^#*/#/' -i /etc/fstab".to_string(),
            "cat <<EOF > /etc/yum.repos.d/kubernetes.repo".to_string(),
            "[kubernetes]".to_string(),
            "name=Kubernetes".to_string(),
            "baseurl=https://packages.cloud.google.com/yum/repos/kubernetes-el7-\\$basearch"
                .to_string(),
            "enabled=1".to_string(),
            "gpgcheck=1".to_string(),
            "repo_gpgcheck=1".to_string(),
            "gpgkey=https://packages.cloud.google.com/yum/doc/yum-key.gpg https://packages.cloud.google.com/yum/doc/rpm-package-key.gpg"
                .to_string(),
            "exclude=kubelet kubeadm kubectl".to_string(),
            "EOF".to_string(),
            "setenforce 0".to_string(),
            "sed -i 's/^SELINUX=enforcing$/SELINUX=permissive/' /etc/selinux/config".to_string(),
            format!(
                "yum install docker kubeadm-{v}-0 kubectl-{v}-0 kubelet-{v}-0 kubernetes-cni -y --disableexcludes=kubernetes",
                v = kubernetes_version
            ),
            "systemctl enable --now kubelet".to_string(),
            format!("hostname {hostname}"),
            "systemctl enable docker".to_string(),
            "systemctl start docker".to_string(),
            join_command.to_string(),
            "systemctl daemon-reload".to_string(),
            "systemctl restart kubelet".to_string(),
        ],
    }
}

/// Commands that strip a machine of any previous cluster membership
///
/// Provisioning is always uninstall-then-reinstall: the node is reset,
/// packages are purged, and firewall state is flushed so a retried or
/// recovered install starts clean.
pub fn uninstall_commands(os: OsFamily) -> Vec<String> {
    match os {
        OsFamily::Ubuntu | OsFamily::Debian => vec![
            "kubeadm reset -f".to_string(),
            "apt-get purge kubeadm kubectl kubelet kubernetes-cni kube* docker-engine docker docker.io docker-ce -y"
                .to_string(),
            "apt-get autoremove -y".to_string(),
            "rm -rf ~/.kube".to_string(),
            "iptables -F && iptables -t nat -F && iptables -t mangle -F && iptables -X".to_string(),
        ],
        OsFamily::Centos => vec![
            "kubeadm reset -f".to_string(),
            "yum remove kubeadm kubectl kubelet kubernetes-cni kube* docker docker-ce docker-ce-cli docker-client docker-client-latest docker-common docker-latest docker-latest-logrotate docker-logrotate docker-engine -y"
                .to_string(),
            "yum clean all -y".to_string(),
            "yum autoremove -y".to_string(),
            "rm -rf ~/.kube".to_string(),
            "iptables -F && iptables -t nat -F && iptables -t mangle -F && iptables -X".to_string(),
        ],
    }
}

/// Commands that bounce the runtime and node agent during recovery
///
/// Reasserts the hostname, stops the container runtime and kubelet, flushes
/// firewall rules, and starts both again. Run before the recovery reboot.
pub fn reconfigure_commands(os: OsFamily, hostname: &str) -> Vec<String> {
    let flush: [&str; 2] = match os {
        OsFamily::Ubuntu | OsFamily::Debian => ["iptables --flush", "iptables -tnat --flush"],
        OsFamily::Centos => ["iptables -F", "iptables -tnat -F"],
    };
    vec![
        format!("hostname {hostname}"),
        "systemctl stop docker".to_string(),
        "systemctl stop kubelet".to_string(),
        flush[0].to_string(),
        flush[1].to_string(),
        "systemctl start docker".to_string(),
        "systemctl start kubelet".to_string(),
    ]
}

/// Delayed restart issued at the recovery reboot step (effective in one
/// minute, leaving time to close the session cleanly)
pub const REBOOT_COMMAND: &str = "sudo shutdown -r +1";

/// Privilege escalation prefix for interactive provisioning sessions
pub const ELEVATE_COMMAND: &str = "sudo su";

#[cfg(test)]
mod tests {
    use super::*;

    const UBUNTU_RELEASE: &[u8] = b"NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"20.04\"\n";
    const DEBIAN_RELEASE: &[u8] = b"PRETTY_NAME=\"Debian GNU/Linux 11\"\nID=\"debian\"\n";
    const CENTOS_RELEASE: &[u8] = b"NAME=\"CentOS Linux\"\nID=\"centos\"\nVERSION_ID=\"7\"\n";
    const JOIN: &str = "kubeadm join 192.0.2.1:6443 --token abcdef.0123456789abcdef";

    // =========================================================================
    // OS Detection Stories
    // =========================================================================

    /// Story: The probe output identifies each supported distribution
    ///
    /// `/etc/os-release` quotes the ID field on some distributions and not
    /// others; both forms must parse.
    #[test]
    fn story_detects_supported_distributions() {
        assert_eq!(detect_os(UBUNTU_RELEASE), Some(OsFamily::Ubuntu));
        assert_eq!(detect_os(DEBIAN_RELEASE), Some(OsFamily::Debian));
        assert_eq!(detect_os(CENTOS_RELEASE), Some(OsFamily::Centos));
    }

    /// Story: Unsupported distributions are a hard error upstream
    #[test]
    fn story_unknown_distribution_is_none() {
        assert_eq!(detect_os(b"NAME=\"Alpine Linux\"\nID=alpine\n"), None);
        assert_eq!(detect_os(b""), None);
        assert_eq!(detect_os(b"garbage output"), None);
    }

    /// Story: ID is matched as a whole line, not a substring
    ///
    /// `ID_LIKE=debian` alone must not classify a machine as Debian.
    #[test]
    fn story_id_like_does_not_classify() {
        assert_eq!(detect_os(b"ID_LIKE=debian\nID=alpine\n"), None);
    }

    // =========================================================================
    // Install Sequence Stories
    // =========================================================================

    /// Story: Installation pins the requested package version
    #[test]
    fn story_install_pins_kubernetes_version() {
        let commands = install_commands(OsFamily::Ubuntu, "edge-7.acme.trellis.dev", "1.19.2", JOIN);
        assert!(commands
            .iter()
            .any(|c| c.contains("kubeadm=1.19.2-00") && c.contains("kubelet=1.19.2-00")));

        let commands = install_commands(OsFamily::Centos, "edge-7.acme.trellis.dev", "1.19.2", JOIN);
        assert!(commands
            .iter()
            .any(|c| c.contains("kubeadm-1.19.2-0") && c.contains("--disableexcludes=kubernetes")));
    }

    /// Story: The join command runs after the runtime is up and before the
    /// final kubelet restart
    #[test]
    fn story_join_runs_after_runtime_start() {
        for os in [OsFamily::Ubuntu, OsFamily::Debian, OsFamily::Centos] {
            let commands = install_commands(os, "edge-7.acme.trellis.dev", "1.19.2", JOIN);
            let start = commands
                .iter()
                .position(|c| c == "systemctl start docker")
                .unwrap();
            let join = commands.iter().position(|c| c == JOIN).unwrap();
            let restart = commands
                .iter()
                .position(|c| c == "systemctl restart kubelet")
                .unwrap();
            assert!(start < join, "{os:?}: join must follow runtime start");
            assert!(join < restart, "{os:?}: kubelet restart must follow join");
        }
    }

    /// Story: Installation assigns the derived cluster hostname
    #[test]
    fn story_install_sets_hostname() {
        let commands = install_commands(OsFamily::Debian, "edge-7.acme.trellis.dev", "1.19.2", JOIN);
        assert!(commands.contains(&"hostname edge-7.acme.trellis.dev".to_string()));
    }

    /// Story: Bridged networking prerequisites precede package installation
    #[test]
    fn story_install_prepares_bridged_networking_and_swap() {
        for os in [OsFamily::Ubuntu, OsFamily::Centos] {
            let commands = install_commands(os, "n.trellis.dev", "1.19.2", JOIN);
            let modprobe = commands.iter().position(|c| c == "modprobe br_netfilter").unwrap();
            let swapoff = commands.iter().position(|c| c == "swapoff -a").unwrap();
            let join = commands.iter().position(|c| c == JOIN).unwrap();
            assert!(modprobe < join);
            assert!(swapoff < join);
        }
    }

    /// Story: Ubuntu installs the distro runtime, Debian the upstream one
    #[test]
    fn story_debian_family_differs_only_in_runtime_source() {
        let ubuntu = install_commands(OsFamily::Ubuntu, "n.trellis.dev", "1.19.2", JOIN);
        let debian = install_commands(OsFamily::Debian, "n.trellis.dev", "1.19.2", JOIN);
        assert!(ubuntu.iter().any(|c| c.contains("docker.io")));
        assert!(debian.iter().any(|c| c.contains("docker-ce")));
        assert!(debian
            .iter()
            .any(|c| c.contains("download.docker.com/linux/debian")));
    }

    // =========================================================================
    // Uninstall and Reconfigure Stories
    // =========================================================================

    /// Story: Uninstall resets cluster membership before purging packages
    #[test]
    fn story_uninstall_resets_then_purges() {
        for os in [OsFamily::Ubuntu, OsFamily::Centos] {
            let commands = uninstall_commands(os);
            assert_eq!(commands[0], "kubeadm reset -f");
            assert!(commands.iter().any(|c| c.contains("iptables -F")));
            assert!(commands.contains(&"rm -rf ~/.kube".to_string()));
        }
    }

    /// Story: Reconfiguration bounces the runtime around a firewall flush
    #[test]
    fn story_reconfigure_stops_flushes_and_restarts() {
        let commands = reconfigure_commands(OsFamily::Centos, "edge-7.acme.trellis.dev");
        assert_eq!(commands[0], "hostname edge-7.acme.trellis.dev");
        let stop = commands.iter().position(|c| c == "systemctl stop kubelet").unwrap();
        let flush = commands.iter().position(|c| c == "iptables -F").unwrap();
        let start = commands.iter().position(|c| c == "systemctl start kubelet").unwrap();
        assert!(stop < flush && flush < start);
    }
}
