// NUMA topology discovery and best-effort thread pinning.
//
// Topology is read once: on Linux from /sys/devices/system/node, on Windows
// from GetNumaHighestNodeNumber. Pinning failures are non-fatal; callers
// observe the outcome and fall back to node 0 placement.

use once_cell::sync::Lazy;
use std::cell::Cell;

/// CPU assignment per NUMA node, detected at first use.
pub struct Topology {
    /// node index -> logical CPU ids
    nodes: Vec<Vec<usize>>,
}

static TOPOLOGY: Lazy<Topology> = Lazy::new(Topology::detect);

thread_local! {
    static PINNED_NODE: Cell<i32> = const { Cell::new(-1) };
}

impl Topology {
    #[cfg(target_os = "linux")]
    fn detect() -> Self {
        let mut nodes = Vec::new();
        for node in 0..usize::MAX {
            let path = format!("/sys/devices/system/node/node{node}/cpulist");
            match std::fs::read_to_string(&path) {
                Ok(list) => nodes.push(parse_cpulist(list.trim())),
                Err(_) => break,
            }
        }
        if nodes.is_empty() {
            nodes.push((0..num_cpus::get()).collect());
        }
        Self { nodes }
    }

    #[cfg(windows)]
    fn detect() -> Self {
        use windows_sys::Win32::System::SystemInformation::{
            GetNumaHighestNodeNumber, GetNumaNodeProcessorMask,
        };

        let mut highest: u32 = 0;
        let ok = unsafe { GetNumaHighestNodeNumber(&mut highest) };
        if ok == 0 {
            return Self {
                nodes: vec![(0..num_cpus::get()).collect()],
            };
        }

        let mut nodes = Vec::with_capacity(highest as usize + 1);
        for node in 0..=highest {
            let mut mask: u64 = 0;
            let cpus = if unsafe { GetNumaNodeProcessorMask(node as u8, &mut mask) } != 0 {
                (0..64).filter(|bit| mask & (1u64 << bit) != 0).collect()
            } else {
                Vec::new()
            };
            nodes.push(cpus);
        }
        Self { nodes }
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    fn detect() -> Self {
        Self {
            nodes: vec![(0..num_cpus::get()).collect()],
        }
    }
}

#[cfg(target_os = "linux")]
fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// Number of NUMA nodes on this machine (at least 1).
pub fn node_count() -> usize {
    TOPOLOGY.nodes.len()
}

/// The node this thread pinned itself to, if any.
pub fn pinned_node() -> Option<usize> {
    let node = PINNED_NODE.with(|n| n.get());
    (node >= 0).then_some(node as usize)
}

/// The node new allocations for this thread should prefer: the pinned
/// node when present, else node 0.
pub fn preferred_node() -> usize {
    pinned_node().unwrap_or(0)
}

/// Resolve a caller-supplied NUMA hint. Negative hints mean "the calling
/// worker's node"; out-of-range hints clamp to the highest node.
pub fn resolve_hint(hint: i32) -> usize {
    if hint < 0 {
        preferred_node()
    } else {
        (hint as usize).min(node_count() - 1)
    }
}

/// Pin the calling thread to the CPUs of `node`. Best-effort: returns
/// whether the affinity call succeeded, and records the node for
/// `preferred_node` on success.
pub fn pin_thread_to_node(node: usize) -> bool {
    let ok = pin_impl(node);
    if ok {
        PINNED_NODE.with(|n| n.set(node as i32));
    }
    ok
}

#[cfg(target_os = "linux")]
fn pin_impl(node: usize) -> bool {
    let Some(cpus) = TOPOLOGY.nodes.get(node) else {
        return false;
    };
    if cpus.is_empty() {
        return false;
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            if cpu < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(windows)]
fn pin_impl(node: usize) -> bool {
    use windows_sys::Win32::System::SystemInformation::GetNumaNodeProcessorMask;
    use windows_sys::Win32::System::Threading::{GetCurrentThread, SetThreadAffinityMask};

    if node >= TOPOLOGY.nodes.len() {
        return false;
    }
    let mut mask: u64 = 0;
    if unsafe { GetNumaNodeProcessorMask(node as u8, &mut mask) } == 0 || mask == 0 {
        return false;
    }
    unsafe { SetThreadAffinityMask(GetCurrentThread(), mask as usize) != 0 }
}

#[cfg(not(any(target_os = "linux", windows)))]
fn pin_impl(_node: usize) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_has_at_least_one_node() {
        assert!(node_count() >= 1);
    }

    #[test]
    fn test_resolve_hint() {
        assert_eq!(resolve_hint(-1), preferred_node());
        assert_eq!(resolve_hint(0), 0);
        // Out-of-range hints clamp rather than fail.
        assert!(resolve_hint(i32::MAX) < node_count());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_cpulist() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpulist("0-1,8-9"), vec![0, 1, 8, 9]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
    }

    #[test]
    fn test_pin_records_preferred_node() {
        if pin_thread_to_node(0) {
            assert_eq!(pinned_node(), Some(0));
            assert_eq!(preferred_node(), 0);
        }
    }
}
