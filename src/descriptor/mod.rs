//! Bin descriptors for the power model.
//!
//! A processor template (XML tree of `component` elements holding `param`
//! and `stat` children) is copied once per bin with selected values
//! overwritten from that bin's statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::debug;

use crate::derive::{ratio, Capabilities, INSTRUCTIONS_PER_ICACHE_READ};
use crate::reduce::PhysicalBin;
use crate::stats::Bin;

/// Share of cache accesses and misses assumed to be reads.
const READ_SHARE: f64 = 0.75;

/// Multiplier accesses as a share of integer instructions.
const MUL_SHARE: f64 = 0.05;

/// Fixed multiplier duty cycle; the core has no multiplier counter.
const MUL_DUTY_CYCLE: f64 = 0.3;

/// Cycles an FP uop keeps the FPU busy.
const FPU_OCCUPANCY: f64 = 20.0;

/// Template child element kinds that can be overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKind {
    Param,
    Stat,
}

impl FieldKind {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"param" => Some(Self::Param),
            b"stat" => Some(Self::Stat),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Param => "param",
            Self::Stat => "stat",
        }
    }
}

type FieldKey = (String, FieldKind, String);

/// Values to write into a template, keyed by component id and field name.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    fields: BTreeMap<FieldKey, String>,
}

impl Overrides {
    pub fn set_param(&mut self, component: &str, name: &str, value: impl Display) {
        self.set(component, FieldKind::Param, name, value);
    }

    pub fn set_stat(&mut self, component: &str, name: &str, value: impl Display) {
        self.set(component, FieldKind::Stat, name, value);
    }

    /// Writes a count, truncated to an integer.
    pub fn set_count(&mut self, component: &str, name: &str, value: f64) {
        self.set_stat(component, name, value.trunc() as i64);
    }

    fn set(&mut self, component: &str, kind: FieldKind, name: &str, value: impl Display) {
        self.fields.insert(
            (component.to_string(), kind, name.to_string()),
            value.to_string(),
        );
    }

    pub fn get(&self, component: &str, kind: FieldKind, name: &str) -> Option<&str> {
        self.fields
            .get(&(component.to_string(), kind, name.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A rendered descriptor plus overrides the template had no slot for.
#[derive(Debug, Clone)]
pub struct RenderedDescriptor {
    pub xml: String,
    /// `component/kind/name` of every override that matched nothing.
    pub unmatched: Vec<String>,
}

/// Processor topology template.
#[derive(Debug, Clone)]
pub struct Template {
    xml: String,
    cores: usize,
    private_l2: usize,
}

impl Template {
    pub fn load(path: &Path) -> Result<Self> {
        let xml = fs::read_to_string(path)
            .with_context(|| format!("reading processor model {}", path.display()))?;
        Self::parse(xml).with_context(|| format!("parsing processor model {}", path.display()))
    }

    /// Validates the template and records its topology.
    pub fn parse(xml: String) -> Result<Self> {
        let ids = component_ids(&xml)?;
        if !ids.contains("system") {
            bail!("template has no `system` component");
        }

        let numbered = |prefix: &str| {
            ids.iter()
                .filter_map(|id| id.strip_prefix(prefix))
                .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                .count()
        };
        let cores = numbered("system.core");
        let private_l2 = numbered("system.L2");

        Ok(Self {
            xml,
            cores,
            private_l2,
        })
    }

    /// Number of `system.core<N>` components.
    pub fn core_count(&self) -> usize {
        self.cores
    }

    /// Number of `system.L2<N>` components.
    pub fn l2_count(&self) -> usize {
        self.private_l2
    }

    /// Copies the template, overwriting the `value` attribute of every
    /// `param`/`stat` named in `overrides` under its enclosing component.
    pub fn render(&self, overrides: &Overrides) -> Result<RenderedDescriptor> {
        let mut reader = Reader::from_str(&self.xml);
        let mut writer = Writer::new(Vec::with_capacity(self.xml.len()));
        // One entry per open element; `Some(id)` for components.
        let mut open: Vec<Option<String>> = Vec::new();
        let mut matched = BTreeSet::new();

        loop {
            let event = reader.read_event()?;
            let component = open.iter().rev().flatten().next().map(String::as_str);
            match event {
                Event::Eof => break,
                Event::Start(e) => {
                    let id = if e.name().as_ref() == b"component" {
                        attr_value(&e, b"id")?
                    } else {
                        None
                    };
                    let e = rewrite(e, component, overrides, &mut matched)?;
                    open.push(id);
                    writer.write_event(Event::Start(e))?;
                }
                Event::Empty(e) => {
                    let e = rewrite(e, component, overrides, &mut matched)?;
                    writer.write_event(Event::Empty(e))?;
                }
                Event::End(e) => {
                    open.pop();
                    writer.write_event(Event::End(e))?;
                }
                other => writer.write_event(other)?,
            }
        }

        let unmatched = overrides
            .fields
            .keys()
            .filter(|key| !matched.contains(*key))
            .map(|(component, kind, name)| format!("{component}/{}/{name}", kind.as_str()))
            .collect();

        Ok(RenderedDescriptor {
            xml: String::from_utf8(writer.into_inner()).context("descriptor is not UTF-8")?,
            unmatched,
        })
    }
}

fn component_ids(xml: &str) -> Result<BTreeSet<String>> {
    let mut reader = Reader::from_str(xml);
    let mut ids = BTreeSet::new();
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"component" => {
                if let Some(id) = attr_value(&e, b"id")? {
                    ids.insert(id);
                }
            }
            _ => {}
        }
    }
    Ok(ids)
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn rewrite<'a>(
    e: BytesStart<'a>,
    component: Option<&str>,
    overrides: &Overrides,
    matched: &mut BTreeSet<FieldKey>,
) -> Result<BytesStart<'a>> {
    let (Some(kind), Some(component)) = (FieldKind::from_tag(e.name().as_ref()), component) else {
        return Ok(e);
    };
    let Some(name) = attr_value(&e, b"name")? else {
        return Ok(e);
    };
    let Some(value) = overrides.get(component, kind, &name) else {
        return Ok(e);
    };
    matched.insert((component.to_string(), kind, name));

    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(tag);
    let mut replaced = false;
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"value" {
            out.push_attribute(("value", value));
            replaced = true;
        } else {
            out.push_attribute(attr);
        }
    }
    if !replaced {
        out.push_attribute(("value", value));
    }
    Ok(out)
}

/// Inputs for one bin's descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorInput<'a> {
    /// Derived TOTAL bin.
    pub total: &'a Bin,
    /// Reduced bin of every physical core, in core order.
    pub cores: &'a [&'a PhysicalBin],
    pub caps: Capabilities,
    pub bin_size_secs: f64,
    pub tsc_frequency_hz: f64,
}

/// Computes every descriptor field for one bin.
pub fn build_overrides(input: &DescriptorInput<'_>) -> Overrides {
    let mut out = Overrides::default();
    let sim_cycles = input.bin_size_secs * input.tsc_frequency_hz;
    out.set_stat("system", "total_cycles", sim_cycles);

    let total = input.total;
    if input.caps.l3 {
        let accesses = total.value("l3_accesses").trunc();
        let misses = total.value("l3_misses").trunc();
        set_read_write_split(&mut out, "system.L30", accesses, misses);

        out.set_count("system.mc", "memory_accesses", misses);
        out.set_stat("system.mc", "memory_reads", misses * READ_SHARE);
        out.set_stat("system.mc", "memory_writes", misses * (1.0 - READ_SHARE));
    } else {
        let reads = total.value("l2_read_misses").trunc();
        let writes = total.value("l2_write_misses").trunc();
        out.set_count("system.mc", "memory_accesses", reads + writes);
        out.set_count("system.mc", "memory_reads", reads);
        out.set_count("system.mc", "memory_writes", writes);
    }

    for (k, core) in input.cores.iter().enumerate() {
        core_fields(&mut out, k, core, input);
    }

    out
}

fn set_read_write_split(out: &mut Overrides, component: &str, accesses: f64, misses: f64) {
    out.set_stat(component, "read_accesses", accesses * READ_SHARE);
    out.set_stat(component, "write_accesses", accesses * (1.0 - READ_SHARE));
    out.set_stat(component, "read_misses", misses * READ_SHARE);
    out.set_stat(component, "write_misses", misses * (1.0 - READ_SHARE));
}

fn core_fields(out: &mut Overrides, k: usize, core: &PhysicalBin, input: &DescriptorInput<'_>) {
    let id = format!("system.core{k}");
    let d = &core.stats;

    let uops = d.value("uops_dispatched");
    let retired = d.value("uops_retired");
    let fp = d.value("fp_uops_executed");
    let branches = d.value("branches_executed");
    let loads = d.value("dcache_reads");
    let stores = d.value("dcache_writes");
    let int_estimate = uops - fp - branches;

    out.set_param(
        &id,
        "clock_rate",
        (input.tsc_frequency_hz / 1e6).trunc() as i64,
    );

    out.set_count(&id, "total_instructions", uops);
    out.set_count(&id, "int_instructions", int_estimate);
    out.set_stat(&id, "fp_instructions", fp);
    out.set_stat(&id, "branch_instructions", branches);
    out.set_stat(&id, "branch_mispredictions", d.value("branches_mispredicted"));
    out.set_stat(&id, "load_instructions", loads);
    out.set_stat(&id, "store_instructions", stores);
    out.set_stat(&id, "committed_instructions", retired);
    out.set_stat(&id, "committed_int_instructions", int_estimate);
    out.set_stat(&id, "committed_fp_instructions", d.value("fp_uops_retired"));
    out.set_stat(&id, "context_switches", d.value("context_switches"));

    out.set_stat(&id, "total_cycles", input.bin_size_secs * input.tsc_frequency_hz);
    out.set_stat(&id, "busy_cycles", core.busy_cycles);
    out.set_stat(&id, "idle_cycles", core.idle_cycles);

    for (name, value) in [
        ("ROB_reads", uops),
        ("ROB_writes", retired),
        ("rename_reads", 2.0 * int_estimate),
        ("rename_writes", int_estimate),
        ("fp_rename_reads", 2.0 * fp),
        ("fp_rename_writes", fp),
        ("inst_window_reads", int_estimate + branches),
        ("inst_window_writes", int_estimate + branches),
        ("inst_window_wakeup_accesses", int_estimate + branches),
        ("fp_inst_window_reads", fp),
        ("fp_inst_window_writes", fp),
        ("fp_inst_window_wakeup_accesses", fp),
        ("int_regfile_reads", 2.0 * int_estimate),
        ("float_regfile_reads", 2.0 * fp),
        ("int_regfile_writes", int_estimate),
        ("float_regfile_writes", fp),
        ("ialu_accesses", int_estimate),
        ("fpu_accesses", fp),
        ("mul_accesses", MUL_SHARE * int_estimate),
        ("cdb_alu_accesses", int_estimate),
        ("cdb_mul_accesses", MUL_SHARE * int_estimate),
        ("cdb_fpu_accesses", fp),
    ] {
        out.set_count(&id, name, value);
    }

    let cycles = core.total_cycles;
    let duty = |busy: f64| ratio(busy, cycles).min(1.0);
    for (name, value) in [
        ("pipeline_duty_cycle", duty(uops)),
        ("IFU_duty_cycle", duty(uops)),
        ("LSU_duty_cycle", duty(loads + stores)),
        ("MemManU_I_duty_cycle", duty(uops)),
        ("MemManU_D_duty_cycle", duty(loads + stores)),
        ("ALU_duty_cycle", duty(int_estimate)),
        ("MUL_duty_cycle", MUL_DUTY_CYCLE),
        ("FPU_duty_cycle", duty(fp * FPU_OCCUPANCY)),
        ("ALU_cdb_duty_cycle", duty(int_estimate)),
        ("MUL_cdb_duty_cycle", MUL_DUTY_CYCLE),
        ("FPU_cdb_duty_cycle", duty(fp)),
    ] {
        out.set_stat(&id, name, value);
    }

    let icache_reads = (d.value("instructions").trunc() / INSTRUCTIONS_PER_ICACHE_READ).floor();
    let dcache_accesses = loads.trunc() + stores.trunc();

    let itlb = format!("{id}.itlb");
    out.set_count(&itlb, "total_accesses", icache_reads);
    out.set_count(&itlb, "total_misses", d.value("itlb_misses"));

    let dtlb = format!("{id}.dtlb");
    out.set_count(&dtlb, "total_accesses", dcache_accesses);
    out.set_count(&dtlb, "total_misses", d.value("dtlb_misses"));

    let icache = format!("{id}.icache");
    out.set_count(&icache, "read_accesses", icache_reads);
    out.set_count(&icache, "read_misses", d.value("icache_misses"));

    let dcache = format!("{id}.dcache");
    out.set_count(&dcache, "read_accesses", loads);
    out.set_count(&dcache, "read_misses", d.value("dcache_read_misses"));
    out.set_count(&dcache, "write_accesses", stores);
    out.set_count(&dcache, "write_misses", d.value("dcache_write_misses"));

    set_read_write_split(
        out,
        &format!("system.L2{k}"),
        d.value("l2_accesses").trunc(),
        d.value("l2_misses").trunc(),
    );
}

/// Writes descriptors as `bin_<index>.xml` under one directory.
#[derive(Debug, Clone)]
pub struct DescriptorWriter {
    dir: PathBuf,
}

impl DescriptorWriter {
    /// Recreates `dir`, removing descriptors from earlier runs.
    pub fn create(dir: &Path) -> Result<Self> {
        if dir.exists() {
            fs::remove_dir_all(dir)
                .with_context(|| format!("removing stale descriptors in {}", dir.display()))?;
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("creating descriptor directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!("bin_{index}.xml"))
    }

    pub fn write(&self, index: u64, descriptor: &RenderedDescriptor) -> Result<PathBuf> {
        let path = self.path_for(index);
        fs::write(&path, &descriptor.xml)
            .with_context(|| format!("writing descriptor {}", path.display()))?;
        debug!(bin = index, path = %path.display(), "wrote descriptor");
        Ok(path)
    }
}
