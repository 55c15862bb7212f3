//! The pinned in-guest init script.
//!
//! Mounts the minimal set of pseudo-filesystems, brings up loopback, starts
//! the workload server with JVM tuning that is **load-bearing** for the
//! snapshot sparsification pass (`vm0-snapshot`): `-XX:-AlwaysPreTouch`
//! keeps the heap demand-paged so balloon inflation can actually reclaim
//! unused pages rather than touching them all at boot.

pub const JVM_OPTS: &str =
    "-Xms32m -Xmx4g -XX:-AlwaysPreTouch -XX:+UseG1GC -XX:+TieredCompilation";

pub const READINESS_SENTINEL: &str = "/run/vm0-ready";

/// Render the init script for a given workload version. The script is a
/// POSIX shell script run as PID 1 by the guest kernel (`init=/sbin/vm0-init`
/// in the boot args).
pub fn render(runner_daemon_path: &str, jre_bin: &str, runtime_jar: &str) -> String {
    format!(
        r#"#!/bin/sh
set -e

mount -t proc proc /proc
mount -t sysfs sysfs /sys
mount -t devtmpfs devtmpfs /dev
ip link set lo up

rm -f {sentinel}
{jre_bin} {jvm_opts} -jar {runtime_jar} --ready-sentinel={sentinel} &

while [ ! -f {sentinel} ]; do
    sleep 0.05
done

exec {runner_daemon}
"#,
        sentinel = READINESS_SENTINEL,
        jre_bin = jre_bin,
        jvm_opts = JVM_OPTS,
        runtime_jar = runtime_jar,
        runner_daemon = runner_daemon_path,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_load_bearing_jvm_flag() {
        let script = render("/usr/local/bin/vm0-runner", "/usr/lib/jvm/bin/java", "/opt/runtime.jar");
        assert!(script.contains("-XX:-AlwaysPreTouch"));
        assert!(script.contains("/usr/local/bin/vm0-runner"));
    }

    #[test]
    fn render_polls_readiness_sentinel_before_runner() {
        let script = render("/runner", "/java", "/runtime.jar");
        let sentinel_wait = script.find("while [ ! -f").unwrap_or_else(|| panic!("no wait loop"));
        let exec_runner = script.find("exec /runner").unwrap_or_else(|| panic!("no exec"));
        assert!(sentinel_wait < exec_runner);
    }
}
