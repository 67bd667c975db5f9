use kestrel_lib::KlogLevel;

const DEFAULT_PIC_MASTER_OFFSET: u8 = 0x20;
const DEFAULT_PIC_SLAVE_OFFSET: u8 = 0x28;
const DEFAULT_TIMER_HZ: u32 = 100;
const DEFAULT_SMP_SPINS: u32 = 2_000_000;
const DEFAULT_IPI_SPINS: u32 = 100_000;

/// Boot-time knobs for the interrupt core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterruptConfig {
    pub pic_master_offset: u8,
    pub pic_slave_offset: u8,
    /// Stay on the 8259 pair even when a Local APIC is present.
    pub force_pic: bool,
    pub timer_hz: u32,
    pub smp: bool,
    pub smp_spins: u32,
    pub ipi_spins: u32,
    pub log_level: KlogLevel,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            pic_master_offset: DEFAULT_PIC_MASTER_OFFSET,
            pic_slave_offset: DEFAULT_PIC_SLAVE_OFFSET,
            force_pic: false,
            timer_hz: DEFAULT_TIMER_HZ,
            smp: true,
            smp_spins: DEFAULT_SMP_SPINS,
            ipi_spins: DEFAULT_IPI_SPINS,
            log_level: KlogLevel::Info,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

/// Decimal or `0x` hex, `_` separators allowed.
fn parse_u32(value: &str) -> Option<u32> {
    let (digits, radix) = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (value, 10),
    };
    if digits.trim_matches('_').is_empty() {
        return None;
    }
    digits
        .chars()
        .filter(|c| *c != '_')
        .try_fold(0u32, |acc, c| acc.checked_mul(radix)?.checked_add(c.to_digit(radix)?))
}

fn parse_vector_base(value: &str) -> Option<u8> {
    parse_u32(value)
        .and_then(|v| u8::try_from(v).ok())
        .filter(|v| *v >= 0x20 && *v % 8 == 0)
}

pub fn config_from_cmdline(cmdline: Option<&str>) -> InterruptConfig {
    let mut cfg = InterruptConfig::default();
    let Some(cmdline) = cmdline else {
        return cfg;
    };
    for token in cmdline.split_whitespace() {
        if let Some(value) = token.strip_prefix("irq.pic_master=") {
            if let Some(base) = parse_vector_base(value) {
                cfg.pic_master_offset = base;
            }
        } else if let Some(value) = token.strip_prefix("irq.pic_slave=") {
            if let Some(base) = parse_vector_base(value) {
                cfg.pic_slave_offset = base;
            }
        } else if let Some(value) = token.strip_prefix("irq.force_pic=") {
            if let Some(force) = parse_bool(value) {
                cfg.force_pic = force;
            }
        } else if let Some(value) = token.strip_prefix("timer.hz=") {
            if let Some(hz) = parse_u32(value).filter(|hz| (1..=10_000).contains(hz)) {
                cfg.timer_hz = hz;
            }
        } else if let Some(value) = token.strip_prefix("smp.spins=") {
            if let Some(spins) = parse_u32(value).filter(|s| *s > 0) {
                cfg.smp_spins = spins;
            }
        } else if let Some(value) = token.strip_prefix("smp=") {
            if let Some(smp) = parse_bool(value) {
                cfg.smp = smp;
            }
        } else if let Some(value) = token.strip_prefix("apic.ipi_spins=") {
            if let Some(spins) = parse_u32(value).filter(|s| *s > 0) {
                cfg.ipi_spins = spins;
            }
        } else if let Some(value) = token.strip_prefix("loglevel=") {
            if let Some(level) = KlogLevel::from_name(value) {
                cfg.log_level = level;
            }
        }
    }
    // Overlapping PIC ranges would alias master and slave lines.
    if cfg.pic_master_offset.abs_diff(cfg.pic_slave_offset) < 8 {
        cfg.pic_master_offset = DEFAULT_PIC_MASTER_OFFSET;
        cfg.pic_slave_offset = DEFAULT_PIC_SLAVE_OFFSET;
    }
    cfg
}
