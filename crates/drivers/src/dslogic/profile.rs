//! Supported device table.

use once_cell::sync::Lazy;

/// FPGA bitstream selection for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitstream {
    Single(&'static str),
    /// Base DSLogic boards have switchable input ranges; the bitstream
    /// follows the configured threshold voltage.
    DualRange {
        v3v3: &'static str,
        v5: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct DslogicProfile {
    pub vid: u16,
    pub pid: u16,
    pub vendor: &'static str,
    pub model: &'static str,
    pub firmware: &'static str,
    pub bitstream: Bitstream,
    /// Sixteen probes when set, eight otherwise.
    pub wide: bool,
    /// On-board sample memory, in samples.
    pub mem_depth: u64,
}

pub const VID_DSL: u16 = 0x2a0e;

pub static PROFILES: &[DslogicProfile] = &[
    DslogicProfile {
        vid: VID_DSL,
        pid: 0x0001,
        vendor: "DreamSourceLab",
        model: "DSLogic",
        firmware: "dreamsourcelab-dslogic-fx2.fw",
        bitstream: Bitstream::DualRange {
            v3v3: "dreamsourcelab-dslogic-fpga-3v3.fw",
            v5: "dreamsourcelab-dslogic-fpga-5v.fw",
        },
        wide: true,
        mem_depth: super::protocol::DS_MAX_LOGIC_DEPTH,
    },
    DslogicProfile {
        vid: VID_DSL,
        pid: 0x0003,
        vendor: "DreamSourceLab",
        model: "DSLogic Pro",
        firmware: "dreamsourcelab-dslogic-pro-fx2.fw",
        bitstream: Bitstream::Single("dreamsourcelab-dslogic-pro-fpga.fw"),
        wide: true,
        mem_depth: super::protocol::DS_MAX_LOGIC_DEPTH,
    },
    DslogicProfile {
        vid: VID_DSL,
        pid: 0x0020,
        vendor: "DreamSourceLab",
        model: "DSLogic Plus",
        firmware: "dreamsourcelab-dslogic-plus-fx2.fw",
        bitstream: Bitstream::Single("dreamsourcelab-dslogic-plus-fpga.fw"),
        wide: true,
        mem_depth: super::protocol::DS_MAX_LOGIC_DEPTH,
    },
    DslogicProfile {
        vid: VID_DSL,
        pid: 0x0021,
        vendor: "DreamSourceLab",
        model: "DSLogic Basic",
        firmware: "dreamsourcelab-dslogic-basic-fx2.fw",
        bitstream: Bitstream::Single("dreamsourcelab-dslogic-basic-fpga.fw"),
        wide: true,
        mem_depth: 256 * 1024,
    },
];

pub fn find(vid: u16, pid: u16) -> Option<&'static DslogicProfile> {
    PROFILES.iter().find(|p| p.vid == vid && p.pid == pid)
}

/// Rates the sampling engine can be programmed to.
pub static SAMPLERATES: Lazy<Vec<u64>> = Lazy::new(|| {
    let mut rates: Vec<u64> = Vec::new();
    for exp in [10_000u64, 100_000, 1_000_000, 10_000_000] {
        for mul in [1u64, 2, 5] {
            rates.push(exp * mul);
        }
    }
    rates.push(25_000_000);
    rates.push(100_000_000);
    rates.push(200_000_000);
    rates.push(400_000_000);
    rates.sort_unstable();
    rates.dedup();
    rates
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_lookup() {
        let p = find(VID_DSL, 0x0001).unwrap();
        assert_eq!(p.model, "DSLogic");
        assert!(matches!(p.bitstream, Bitstream::DualRange { .. }));
        assert!(find(VID_DSL, 0x1234).is_none());
        assert!(find(0x1d50, 0x0001).is_none());
    }

    #[test]
    fn samplerate_table_is_sorted_and_bounded() {
        let rates = &*SAMPLERATES;
        assert!(rates.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*rates.first().unwrap(), 10_000);
        assert_eq!(*rates.last().unwrap(), 400_000_000);
        assert!(rates.contains(&super::super::protocol::DS_MAX_LOGIC_SAMPLERATE));
    }
}
