use std::{collections::BTreeMap, fmt::Display, str::FromStr, sync::OnceLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{error::Error, provider::ProviderId};

/// How the value of a [`ResultEntry`](crate::ResultEntry) is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultType {
    String,
    Integer,
    Floating,
}

impl Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResultType::String => "STRING",
            ResultType::Integer => "INTEGER",
            ResultType::Floating => "FLOATING",
        };
        f.write_str(name)
    }
}

/// Static description of a [`Measure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeasureInfo {
    pub provider: ProviderId,
    #[serde(rename = "type")]
    pub result_type: ResultType,
    pub description: &'static str,
    pub example: &'static str,
}

macro_rules! measure_catalog {
    ($(($variant:ident, $name:literal, $provider:ident, $ty:ident, $desc:literal, $example:literal)),+ $(,)?) => {
        /// A single piece of information that can be tracked.
        ///
        /// The set of measures is closed; each one belongs to exactly one provider and has
        /// exactly one declared [`ResultType`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Measure {
            $($variant,)+
        }

        impl Measure {
            /// Every measure, in declaration order.
            pub const ALL: &'static [Measure] = &[$(Measure::$variant,)+];

            /// The canonical name, e.g. `OS_NAME`.
            pub fn name(self) -> &'static str {
                match self {
                    $(Measure::$variant => $name,)+
                }
            }

            pub fn info(self) -> &'static MeasureInfo {
                match self {
                    $(Measure::$variant => &MeasureInfo {
                        provider: ProviderId::$provider,
                        result_type: ResultType::$ty,
                        description: $desc,
                        example: $example,
                    },)+
                }
            }
        }

        impl FromStr for Measure {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Measure::$variant),)+
                    _ => Err(Error::InvalidMeasure(s.to_string())),
                }
            }
        }
    };
}

measure_catalog!(
    (OsName, "OS_NAME", Os, String,
        "Name and version of the operating system under which is currently running.",
        "Ubuntu 24.04.1 LTS"),
    (OsKernel, "OS_KERNEL", Os, String,
        "The version of the kernel that the operating system is running on.",
        "6.8.0-45-generic"),
    (TimeElapsedWallClockMs, "TIME_ELAPSED_WALL_CLOCK_MS", Time, Floating,
        "The (\"real\") wall clock time in milliseconds elapsed during tracking.",
        "1234.5"),
    (TimeElapsedUserMs, "TIME_ELAPSED_USER_MS", Time, Floating,
        "Time in milliseconds spent in the platform's user mode during tracking.",
        "1234.5"),
    (TimeElapsedSystemMs, "TIME_ELAPSED_SYSTEM_MS", Time, Floating,
        "Time in milliseconds spent in the platform's system mode during tracking.",
        "1234.5"),
    (CpuUsedProcessPercent, "CPU_USED_PROCESS_PERCENT", Cpu, Floating,
        "CPU usage of the tracked process in percent per logical CPU core.",
        "97.3"),
    (CpuUsedSystemPercent, "CPU_USED_SYSTEM_PERCENT", Cpu, Floating,
        "CPU usage of the entire system in percent.",
        "12.5"),
    (CpuAvailableSystemCores, "CPU_AVAILABLE_SYSTEM_CORES", Cpu, Integer,
        "Number of logical CPU cores available in the system.",
        "16"),
    (CpuEnergySystemJoules, "CPU_ENERGY_SYSTEM_JOULES", Energy, Floating,
        "The energy consumed by the CPU by the entire system over the tracked period in joules.",
        "42.7"),
    (CpuFeatures, "CPU_FEATURES", Cpu, String,
        "List of hardware features the CPU supports (e.g., the instruction set, encryption capabilities).",
        "fpu vme de pse tsc msr pae mce"),
    (CpuFrequencyMhz, "CPU_FREQUENCY_MHZ", Cpu, Integer,
        "Current CPU speed in megahertz.",
        "2400"),
    (CpuFrequencyMinMhz, "CPU_FREQUENCY_MIN_MHZ", Cpu, Integer,
        "Minimum possible CPU speed in megahertz.",
        "800"),
    (CpuFrequencyMaxMhz, "CPU_FREQUENCY_MAX_MHZ", Cpu, Integer,
        "Maximum possible CPU speed in megahertz.",
        "4700"),
    (CpuVendorId, "CPU_VENDOR_ID", Cpu, String,
        "A textual name for the vendor of the CPU.",
        "GenuineIntel"),
    (CpuByteOrder, "CPU_BYTE_ORDER", Cpu, String,
        "The endianness (big- or little-endian) used by the CPU.",
        "Little Endian"),
    (CpuArchitecture, "CPU_ARCHITECTURE", Cpu, String,
        "The architecture (x86, x86_64, ARM, ...) of the CPU.",
        "x86_64"),
    (CpuModelName, "CPU_MODEL_NAME", Cpu, String,
        "The name of the concrete CPU model.",
        "Intel(R) Core(TM)2 Quad  CPU   Q8200  @ 2.33GHz"),
    (CpuCoresPerSocket, "CPU_CORES_PER_SOCKET", Cpu, Integer,
        "Number of CPU cores located on a single physical socket.",
        "8"),
    (CpuThreadsPerCore, "CPU_THREADS_PER_CORE", Cpu, Integer,
        "Number of logical CPU cores (threads) per core.",
        "2"),
    (CpuCaches, "CPU_CACHES", Cpu, String,
        "The sizes of each CPU cache (e.g., L1, L2, L3) in kibibytes.",
        "{\"l1d\":\"192 KiB\",\"l1i\":\"384 KiB\",\"l2\":\"3072 KiB\",\"l3\":\"16384 KiB\"}"),
    (CpuVirtualization, "CPU_VIRTUALIZATION", Cpu, String,
        "The virtualization technology supported by the CPU (e.g., VT-x or AMD-V), if any.",
        "VT-x"),
    (RamUsedProcessKb, "RAM_USED_PROCESS_KB", Memory, Integer,
        "Peak RAM usage of the tracked process in kilobytes.",
        "524288"),
    (RamUsedSystemMb, "RAM_USED_SYSTEM_MB", Memory, Integer,
        "Peak RAM usage of the entire system in megabytes.",
        "8192"),
    (RamAvailableSystemMb, "RAM_AVAILABLE_SYSTEM_MB", Memory, Integer,
        "Amount of RAM available in the system in megabytes.",
        "32768"),
    (RamEnergySystemJoules, "RAM_ENERGY_SYSTEM_JOULES", Energy, Floating,
        "The energy consumed by the DRAM by the entire system over the tracked period in joules.",
        "3.2"),
    (GpuSupported, "GPU_SUPPORTED", Gpu, Integer,
        "1 if a GPU is detected in the system, and we support tracking it; 0 otherwise.",
        "1"),
    (GpuModelName, "GPU_MODEL_NAME", Gpu, String,
        "The name of the GPU model detected in the system.",
        "NVIDIA GeForce RTX 4090"),
    (GpuNumCores, "GPU_NUM_CORES", Gpu, Integer,
        "Number of GPU cores available in the system.",
        "16384"),
    (GpuUsedProcessPercent, "GPU_USED_PROCESS_PERCENT", Gpu, Floating,
        "GPU usage of the tracked process in percent.",
        "85.0"),
    (GpuUsedSystemPercent, "GPU_USED_SYSTEM_PERCENT", Gpu, Floating,
        "GPU utilization of the entire system in percent.",
        "90.0"),
    (GpuVramUsedProcessMb, "GPU_VRAM_USED_PROCESS_MB", Gpu, Integer,
        "Peak GPU VRAM usage of the tracked process in megabytes.",
        "2048"),
    (GpuVramUsedSystemMb, "GPU_VRAM_USED_SYSTEM_MB", Gpu, Integer,
        "Peak GPU VRAM usage of the entire system in megabytes.",
        "4096"),
    (GpuVramAvailableSystemMb, "GPU_VRAM_AVAILABLE_SYSTEM_MB", Gpu, Integer,
        "Amount of GPU VRAM available in the system in megabytes.",
        "24576"),
    (GpuEnergySystemJoules, "GPU_ENERGY_SYSTEM_JOULES", Gpu, Floating,
        "The energy consumed by the GPU for the entire system over the tracked period in joules.",
        "120.4"),
    (GitIsRepo, "GIT_IS_REPO", Git, Integer,
        "1 if the current working directory is (part of) a Git repository; 0 otherwise.",
        "1"),
    (GitHash, "GIT_HASH", Git, String,
        "SHA1 hash of all files checked into the repository.",
        "aa5fba7feff8605c3b253b46fc86d7ac1732a586"),
    (GitLastCommitHash, "GIT_LAST_COMMIT_HASH", Git, String,
        "Latest Git commit SHA1 hash.",
        "ff52eaf7c0291edbba93c87917e555c720267740"),
    (GitBranch, "GIT_BRANCH", Git, String,
        "Checked-out Git branch name.",
        "main"),
    (GitBranchUpstream, "GIT_BRANCH_UPSTREAM", Git, String,
        "Upstream branch of the checked-out Git branch name.",
        "origin/main"),
    (GitTags, "GIT_TAGS", Git, String,
        "List of Git tag(s) at the current commit, if any.",
        "[\"1.0.0\"]"),
    (GitRemoteOrigin, "GIT_REMOTE_ORIGIN", Git, String,
        "URL of the `origin` remote if it is set.",
        "git@github.com:tira-io/tirex-tracker.git"),
    (GitUncommittedChanges, "GIT_UNCOMMITTED_CHANGES", Git, Integer,
        "1 if some changes are not yet committed and 0 otherwise.",
        "1"),
    (GitUnpushedChanges, "GIT_UNPUSHED_CHANGES", Git, Integer,
        "1 if some changes are not yet pushed and 0 otherwise.",
        "0"),
    (GitUncheckedFiles, "GIT_UNCHECKED_FILES", Git, Integer,
        "1 if there are files that are neither ignored nor checked into the repository; 0 otherwise.",
        "1"),
);

impl Measure {
    /// Position in [`Measure::ALL`], stable for the lifetime of a build.
    pub fn id(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Measure {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        usize::try_from(raw)
            .ok()
            .and_then(|idx| Measure::ALL.get(idx).copied())
            .ok_or_else(|| Error::InvalidMeasure(raw.to_string()))
    }
}

impl Display for Measure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Measure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Measure {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// The complete catalog, keyed by measure. Built once and shared afterwards.
pub fn measure_infos() -> &'static BTreeMap<Measure, MeasureInfo> {
    static INFOS: OnceLock<BTreeMap<Measure, MeasureInfo>> = OnceLock::new();
    INFOS.get_or_init(|| Measure::ALL.iter().map(|m| (*m, *m.info())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_complete() {
        let infos = measure_infos();
        assert_eq!(infos.len(), Measure::ALL.len());
        for measure in Measure::ALL {
            assert!(infos.contains_key(measure), "{measure} missing");
        }
    }

    #[test]
    fn names_round_trip() {
        for measure in Measure::ALL {
            assert_eq!(measure.name().parse::<Measure>().unwrap(), *measure);
            assert_eq!(Measure::try_from(measure.id()).unwrap(), *measure);
        }
    }

    #[test]
    fn unknown_names_and_ids_are_rejected() {
        assert!(matches!(
            "NOT_A_MEASURE".parse::<Measure>(),
            Err(Error::InvalidMeasure(name)) if name == "NOT_A_MEASURE"
        ));
        let out_of_range = Measure::ALL.len() as u32;
        assert!(matches!(
            Measure::try_from(out_of_range),
            Err(Error::InvalidMeasure(_))
        ));
    }

    #[test]
    fn descriptions_are_filled() {
        for info in measure_infos().values() {
            assert!(!info.description.is_empty());
            assert!(!info.example.is_empty());
        }
    }

    #[test]
    fn serde_uses_canonical_names() {
        let json = serde_json::to_string(&Measure::TimeElapsedWallClockMs).unwrap();
        assert_eq!(json, "\"TIME_ELAPSED_WALL_CLOCK_MS\"");
        let back: Measure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Measure::TimeElapsedWallClockMs);
        assert!(serde_json::from_str::<Measure>("\"BOGUS\"").is_err());
    }
}
