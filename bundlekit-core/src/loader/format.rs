//! Executable format and architecture sniffing from file headers.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use serde::Serialize;

/// Detected executable image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BinaryFormat {
    /// Not classified yet, or the header could not be read.
    Unknown,
    /// Classic `Joy!peff` container; never loadable.
    LegacyCfm,
    MachExecutable,
    MachBundle,
    MachFramework,
    Dll,
    Elf,
    Unreadable,
    /// No executable exists.
    None,
}

impl BinaryFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::LegacyCfm => "legacy-cfm",
            Self::MachExecutable => "mach-executable",
            Self::MachBundle => "mach-bundle",
            Self::MachFramework => "mach-framework",
            Self::Dll => "dll",
            Self::Elf => "elf",
            Self::Unreadable => "unreadable",
            Self::None => "none",
        }
    }
}

impl fmt::Display for BinaryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture of an executable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    X86,
    X86_64,
    Arm,
    Arm64,
    PowerPc,
    PowerPc64,
    RiscV64,
    Other(u32),
}

impl Architecture {
    /// Architecture this process was compiled for.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86" => Some(Self::X86),
            "x86_64" => Some(Self::X86_64),
            "arm" => Some(Self::Arm),
            "aarch64" => Some(Self::Arm64),
            "powerpc" => Some(Self::PowerPc),
            "powerpc64" => Some(Self::PowerPc64),
            "riscv64" => Some(Self::RiscV64),
            _ => None,
        }
    }

    fn from_elf_machine(machine: u16) -> Self {
        match machine {
            3 => Self::X86,
            20 => Self::PowerPc,
            21 => Self::PowerPc64,
            40 => Self::Arm,
            62 => Self::X86_64,
            183 => Self::Arm64,
            243 => Self::RiscV64,
            other => Self::Other(u32::from(other)),
        }
    }

    fn from_mach_cpu(cpu: u32) -> Self {
        match cpu {
            7 => Self::X86,
            0x0100_0007 => Self::X86_64,
            12 => Self::Arm,
            0x0100_000c => Self::Arm64,
            18 => Self::PowerPc,
            0x0100_0012 => Self::PowerPc64,
            other => Self::Other(other),
        }
    }

    fn from_pe_machine(machine: u16) -> Self {
        match machine {
            0x014c => Self::X86,
            0x8664 => Self::X86_64,
            0x01c0 | 0x01c4 => Self::Arm,
            0xaa64 => Self::Arm64,
            other => Self::Other(u32::from(other)),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86 => f.write_str("x86"),
            Self::X86_64 => f.write_str("x86_64"),
            Self::Arm => f.write_str("arm"),
            Self::Arm64 => f.write_str("arm64"),
            Self::PowerPc => f.write_str("ppc"),
            Self::PowerPc64 => f.write_str("ppc64"),
            Self::RiscV64 => f.write_str("riscv64"),
            Self::Other(code) => write!(f, "unknown({code:#x})"),
        }
    }
}

const ELF_MAGIC: u32 = 0x7f45_4c46;
const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;

const MH_EXECUTE: u32 = 2;
const MH_DYLIB: u32 = 6;
const MH_BUNDLE: u32 = 8;

// Java class files share the fat magic; real fat headers have few slices.
const MAX_FAT_SLICES: u32 = 30;
const HEADER_LEN: usize = 4096;

/// Classify the executable at `path`. I/O failures yield [`BinaryFormat::Unknown`].
pub fn sniff_format(path: &Path) -> BinaryFormat {
    match File::open(path).and_then(|mut file| classify_reader(&mut file)) {
        Ok(format) => format,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Cannot read executable header");
            BinaryFormat::Unknown
        }
    }
}

/// Architectures present in the executable at `path`. Empty when unknown.
pub fn sniff_architectures(path: &Path) -> Vec<Architecture> {
    File::open(path)
        .and_then(|mut file| architectures_reader(&mut file))
        .unwrap_or_default()
}

fn read_header<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    reader.take(HEADER_LEN as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn u16_at(bytes: &[u8], offset: usize, big_endian: bool) -> Option<u16> {
    let raw: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(if big_endian {
        u16::from_be_bytes(raw)
    } else {
        u16::from_le_bytes(raw)
    })
}

fn u32_at(bytes: &[u8], offset: usize, big_endian: bool) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(if big_endian {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    })
}

fn mach_endianness(magic: u32) -> Option<bool> {
    match magic {
        MH_MAGIC | MH_MAGIC_64 => Some(true),
        MH_CIGAM | MH_CIGAM_64 => Some(false),
        _ => None,
    }
}

fn fat_slices(header: &[u8]) -> Option<Vec<(u32, u32)>> {
    let magic = u32_at(header, 0, true)?;
    let entry_len = if magic == FAT_MAGIC_64 { 32 } else { 20 };
    let count = u32_at(header, 4, true)?;
    if count == 0 || count > MAX_FAT_SLICES {
        return None;
    }
    (0..count as usize)
        .map(|i| {
            let base = 8 + i * entry_len;
            let cpu = u32_at(header, base, true)?;
            let offset = if magic == FAT_MAGIC_64 {
                u32::try_from(u64::from(u32_at(header, base + 8, true)?) << 32 | u64::from(u32_at(header, base + 12, true)?)).ok()?
            } else {
                u32_at(header, base + 8, true)?
            };
            Some((cpu, offset))
        })
        .collect()
}

/// Classify an image from any seekable source.
pub fn classify_reader<R: Read + Seek>(reader: &mut R) -> io::Result<BinaryFormat> {
    let header = read_header(reader)?;
    let Some(magic) = u32_at(&header, 0, true) else {
        return Ok(BinaryFormat::Unreadable);
    };

    if magic == ELF_MAGIC {
        return Ok(BinaryFormat::Elf);
    }
    if let Some(big_endian) = mach_endianness(magic) {
        return Ok(match u32_at(&header, 12, big_endian) {
            Some(MH_EXECUTE) => BinaryFormat::MachExecutable,
            Some(MH_DYLIB) => BinaryFormat::MachFramework,
            Some(MH_BUNDLE) => BinaryFormat::MachBundle,
            Some(_) => BinaryFormat::MachBundle,
            None => BinaryFormat::Unreadable,
        });
    }
    if magic == FAT_MAGIC || magic == FAT_MAGIC_64 {
        let Some(&(_, offset)) = fat_slices(&header).as_ref().and_then(|s| s.first()) else {
            return Ok(BinaryFormat::Unreadable);
        };
        reader.seek(SeekFrom::Start(u64::from(offset)))?;
        let slice = read_header(reader)?;
        let format = u32_at(&slice, 0, true)
            .and_then(mach_endianness)
            .and_then(|big_endian| u32_at(&slice, 12, big_endian));
        return Ok(match format {
            Some(MH_EXECUTE) => BinaryFormat::MachExecutable,
            Some(MH_DYLIB) => BinaryFormat::MachFramework,
            Some(_) => BinaryFormat::MachBundle,
            None => BinaryFormat::Unreadable,
        });
    }
    if header.starts_with(b"Joy!peff") {
        return Ok(BinaryFormat::LegacyCfm);
    }
    if header.starts_with(b"MZ") {
        return Ok(BinaryFormat::Dll);
    }
    Ok(BinaryFormat::Unreadable)
}

/// List the architectures an image was built for.
pub fn architectures_reader<R: Read + Seek>(reader: &mut R) -> io::Result<Vec<Architecture>> {
    let header = read_header(reader)?;
    let Some(magic) = u32_at(&header, 0, true) else {
        return Ok(Vec::new());
    };

    if magic == ELF_MAGIC {
        let big_endian = header.get(5) == Some(&2);
        return Ok(u16_at(&header, 18, big_endian)
            .map(|machine| vec![Architecture::from_elf_machine(machine)])
            .unwrap_or_default());
    }
    if let Some(big_endian) = mach_endianness(magic) {
        return Ok(u32_at(&header, 4, big_endian)
            .map(|cpu| vec![Architecture::from_mach_cpu(cpu)])
            .unwrap_or_default());
    }
    if magic == FAT_MAGIC || magic == FAT_MAGIC_64 {
        return Ok(fat_slices(&header)
            .unwrap_or_default()
            .into_iter()
            .map(|(cpu, _)| Architecture::from_mach_cpu(cpu))
            .collect());
    }
    if header.starts_with(b"MZ") {
        let machine = u32_at(&header, 0x3c, false).and_then(|pe| {
            let pe = pe as usize;
            (header.get(pe..pe + 4) == Some(b"PE\0\0".as_slice()))
                .then(|| u16_at(&header, pe + 4, false))
                .flatten()
        });
        return Ok(machine
            .map(|m| vec![Architecture::from_pe_machine(m)])
            .unwrap_or_default());
    }
    Ok(Vec::new())
}
