//! Multi-chain record of every traced parameter.
//!
//! Each chain owns one [`ChainTrace`]. A chain trace keeps one
//! [`ParamTrace`] per traced parameter, a row per completed cycle, plus
//! the constants of the run (`statics`) and the most recent conditional
//! distribution of each step (`derived`).
//!
//! Traces can be written to and read from CSV, either as a single table
//! with a `chain` column or as one `chain_{id}.csv` file per chain, and
//! exported to an arrow `RecordBatch`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, Float64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use itertools::Itertools;
use thiserror::Error;

use crate::state::{ChainState, Setup};
use crate::step::{Conditional, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TracedParam {
    Betas,
    Alphas,
    Sigma2,
    Tau2,
    /// `X · Betas`
    XBetas,
    /// `Delta · Alphas`
    DeltaAlphas,
}

#[derive(Debug, Error)]
#[error("unknown traced parameter {0:?}")]
pub struct UnknownParam(pub String);

impl TracedParam {
    /// Parameters that are always traced.
    pub const CORE: [TracedParam; 4] = [
        TracedParam::Betas,
        TracedParam::Alphas,
        TracedParam::Sigma2,
        TracedParam::Tau2,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TracedParam::Betas => "Betas",
            TracedParam::Alphas => "Alphas",
            TracedParam::Sigma2 => "Sigma2",
            TracedParam::Tau2 => "Tau2",
            TracedParam::XBetas => "XBetas",
            TracedParam::DeltaAlphas => "DeltaAlphas",
        }
    }

    pub fn is_scalar(self) -> bool {
        matches!(self, TracedParam::Sigma2 | TracedParam::Tau2)
    }

    /// Number of values recorded per cycle.
    pub fn width(self, setup: &Setup) -> usize {
        match self {
            TracedParam::Betas => setup.p(),
            TracedParam::Alphas => setup.j(),
            TracedParam::Sigma2 | TracedParam::Tau2 => 1,
            TracedParam::XBetas | TracedParam::DeltaAlphas => setup.n(),
        }
    }

    fn extend_from(self, state: &ChainState, out: &mut Vec<f64>) {
        match self {
            TracedParam::Betas => out.extend(state.betas().iter().copied()),
            TracedParam::Alphas => out.extend(state.alphas().iter().copied()),
            TracedParam::Sigma2 => out.push(state.sigma2()),
            TracedParam::Tau2 => out.push(state.tau2()),
            TracedParam::XBetas => out.extend(state.x_betas().iter().copied()),
            TracedParam::DeltaAlphas => out.extend(state.delta_alphas().iter().copied()),
        }
    }

    fn column_name(self, width: usize, index: usize) -> String {
        if self.is_scalar() && width == 1 {
            self.name().to_string()
        } else {
            format!("{}[{}]", self.name(), index)
        }
    }
}

impl fmt::Display for TracedParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TracedParam {
    type Err = UnknownParam;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "Betas" => TracedParam::Betas,
            "Alphas" => TracedParam::Alphas,
            "Sigma2" => TracedParam::Sigma2,
            "Tau2" => TracedParam::Tau2,
            "XBetas" => TracedParam::XBetas,
            "DeltaAlphas" => TracedParam::DeltaAlphas,
            _ => return Err(UnknownParam(s.to_string())),
        })
    }
}

/// All recorded values of one parameter in one chain, in cycle order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTrace {
    param: TracedParam,
    width: usize,
    len: usize,
    values: Vec<f64>,
}

impl ParamTrace {
    fn new(param: TracedParam, width: usize) -> Self {
        Self {
            param,
            width,
            len: 0,
            values: Vec::new(),
        }
    }

    fn push(&mut self, draw: &[f64]) {
        assert!(draw.len() == self.width, "Mismatched draw width for {}", self.param);
        self.values.extend_from_slice(draw);
        self.len += 1;
    }

    pub fn param(&self) -> TracedParam {
        self.param
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flat values, one block of `width` per cycle.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, draw: usize) -> Option<&[f64]> {
        (draw < self.len).then(|| &self.values[draw * self.width..(draw + 1) * self.width])
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &[f64]> + ExactSizeIterator + '_ {
        (0..self.len).map(move |draw| &self.values[draw * self.width..(draw + 1) * self.width])
    }

    /// Values of entry `index` across all cycles.
    pub fn column(&self, index: usize) -> impl Iterator<Item = f64> + '_ {
        assert!(index < self.width);
        self.iter().map(move |draw| draw[index])
    }

    /// Entrywise mean of the cycles after the first `burn`.
    pub fn mean(&self, burn: usize) -> Vec<f64> {
        let kept = self.len.saturating_sub(burn);
        let mut sum = vec![0f64; self.width];
        for draw in self.iter().skip(burn) {
            sum.iter_mut().zip(draw).for_each(|(s, x)| *s += x);
        }
        sum.iter_mut().for_each(|s| *s /= kept as f64);
        sum
    }

    /// Entrywise standard deviation of the cycles after the first `burn`.
    pub fn std(&self, burn: usize) -> Vec<f64> {
        let kept = self.len.saturating_sub(burn);
        let mean = self.mean(burn);
        let mut sum = vec![0f64; self.width];
        for draw in self.iter().skip(burn) {
            sum.iter_mut()
                .zip(draw.iter().zip(&mean))
                .for_each(|(s, (x, m))| *s += (x - m) * (x - m));
        }
        let denom = kept.saturating_sub(1).max(1) as f64;
        sum.into_iter().map(|s| (s / denom).sqrt()).collect()
    }
}

/// Trace of a single chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTrace {
    chain: u64,
    params: Vec<ParamTrace>,
    statics: BTreeMap<String, f64>,
    derived: BTreeMap<Step, Conditional>,
}

impl ChainTrace {
    pub fn new(chain: u64, layout: &[(TracedParam, usize)]) -> Self {
        Self {
            chain,
            params: layout
                .iter()
                .map(|&(param, width)| ParamTrace::new(param, width))
                .collect(),
            statics: BTreeMap::new(),
            derived: BTreeMap::new(),
        }
    }

    pub(crate) fn with_statics(mut self, statics: &[(&'static str, f64)]) -> Self {
        self.statics = statics
            .iter()
            .map(|&(name, value)| (name.to_string(), value))
            .collect();
        self
    }

    pub(crate) fn record(&mut self, state: &ChainState) {
        let mut buffer = Vec::new();
        for trace in self.params.iter_mut() {
            buffer.clear();
            trace.param.extend_from(state, &mut buffer);
            trace.push(&buffer);
        }
    }

    pub(crate) fn set_derived(&mut self, step: Step, conditional: Conditional) {
        self.derived.insert(step, conditional);
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    /// Number of recorded cycles.
    pub fn len(&self) -> usize {
        self.params.first().map(|trace| trace.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn params(&self) -> &[ParamTrace] {
        &self.params
    }

    pub fn get(&self, param: TracedParam) -> Option<&ParamTrace> {
        self.params.iter().find(|trace| trace.param == param)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ParamTrace> {
        name.parse().ok().and_then(|param| self.get(param))
    }

    /// Constants of the run, e.g. the posterior shapes `Sigma2_an` and `Tau2_an`.
    pub fn statics(&self) -> &BTreeMap<String, f64> {
        &self.statics
    }

    /// The most recent conditional distribution of each step.
    pub fn derived(&self) -> &BTreeMap<Step, Conditional> {
        &self.derived
    }

    pub fn draw(&self, index: usize) -> Option<DrawView<'_>> {
        (index < self.len()).then_some(DrawView { trace: self, index })
    }

    /// The most recent draw.
    pub fn front(&self) -> Option<DrawView<'_>> {
        self.len().checked_sub(1).and_then(|index| self.draw(index))
    }

    /// The earliest draw.
    pub fn back(&self) -> Option<DrawView<'_>> {
        self.draw(0)
    }

    /// All draws in cycle order. Reverse it to replay from the front.
    pub fn draws(&self) -> impl DoubleEndedIterator<Item = DrawView<'_>> + ExactSizeIterator {
        (0..self.len()).map(move |index| DrawView { trace: self, index })
    }

    fn column_names(&self) -> Vec<String> {
        self.params
            .iter()
            .flat_map(|trace| {
                (0..trace.width).map(move |index| trace.param.column_name(trace.width, index))
            })
            .collect()
    }

    fn layout(&self) -> Vec<(TracedParam, usize)> {
        self.params.iter().map(|t| (t.param, t.width)).collect()
    }
}

/// Values of all traced parameters at one cycle.
#[derive(Debug, Clone, Copy)]
pub struct DrawView<'a> {
    trace: &'a ChainTrace,
    index: usize,
}

impl<'a> DrawView<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, param: TracedParam) -> Option<&'a [f64]> {
        self.trace.get(param).and_then(|trace| trace.get(self.index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (TracedParam, &'a [f64])> + 'a {
        let index = self.index;
        self.trace
            .params
            .iter()
            .filter_map(move |trace| trace.get(index).map(|draw| (trace.param, draw)))
    }
}

/// Traces of all chains of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    chains: Vec<ChainTrace>,
}

impl From<Vec<ChainTrace>> for Trace {
    fn from(mut chains: Vec<ChainTrace>) -> Self {
        chains.sort_unstable_by_key(|chain| chain.chain);
        Trace { chains }
    }
}

impl Trace {
    pub(crate) fn new(setup: &Setup, num_chains: usize, params: &[TracedParam]) -> Self {
        let layout = params
            .iter()
            .map(|&param| (param, param.width(setup)))
            .collect_vec();
        let statics = setup.statics();
        (0..num_chains as u64)
            .map(|chain| ChainTrace::new(chain, &layout).with_statics(&statics))
            .collect_vec()
            .into()
    }

    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn chains(&self) -> &[ChainTrace] {
        &self.chains
    }

    pub(crate) fn chains_mut(&mut self) -> &mut [ChainTrace] {
        &mut self.chains
    }

    pub fn chain(&self, chain: usize) -> Option<&ChainTrace> {
        self.chains.get(chain)
    }

    pub fn get(&self, chain: usize, param: TracedParam) -> Option<&ParamTrace> {
        self.chain(chain).and_then(|trace| trace.get(param))
    }

    /// Export one chain as an arrow table with one row per cycle.
    pub fn to_record_batch(&self, chain: usize) -> Result<RecordBatch> {
        let Some(trace) = self.chain(chain) else {
            bail!("No chain with index {}", chain);
        };
        let len = trace.len();

        let mut fields = vec![
            Field::new("chain", DataType::UInt64, false),
            Field::new("iteration", DataType::UInt64, false),
        ];
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from(vec![trace.chain; len])),
            Arc::new(UInt64Array::from_iter_values(0..len as u64)),
        ];
        for param in trace.params.iter() {
            for index in 0..param.width {
                let name = param.param.column_name(param.width, index);
                fields.push(Field::new(name, DataType::Float64, false));
                let values = param.column(index).collect_vec();
                columns.push(Arc::new(Float64Array::from(values)));
            }
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .context("Could not build record batch from trace")
    }

    /// Write all chains into one table with leading `chain` and
    /// `iteration` columns.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        let Some(first) = self.chains.first() else {
            writer.flush()?;
            return Ok(());
        };
        let layout = first.layout();
        if let Some(other) = self.chains.iter().find(|c| c.layout() != layout) {
            bail!(
                "Chain {} traces different parameters than chain {}",
                other.chain,
                first.chain
            );
        }
        write_header(&mut writer, first)?;
        for chain in self.chains.iter() {
            write_rows(&mut writer, chain)?;
        }
        writer.flush().context("Failed to flush CSV writer")?;
        Ok(())
    }

    pub fn write_csv_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create CSV file: {:?}", path))?;
        self.write_csv(BufWriter::new(file))
    }

    /// Write one `chain_{id}.csv` per chain into `output_dir`.
    pub fn write_csv_dir<P: AsRef<Path>>(&self, output_dir: P) -> Result<()> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;
        for chain in self.chains.iter() {
            let file_path = output_dir.join(format!("chain_{}.csv", chain.chain));
            let file = File::create(&file_path)
                .with_context(|| format!("Failed to create CSV file: {:?}", file_path))?;
            let mut writer = csv::Writer::from_writer(BufWriter::new(file));
            write_header(&mut writer, chain)?;
            write_rows(&mut writer, chain)?;
            writer
                .flush()
                .with_context(|| format!("Failed to flush CSV file: {:?}", file_path))?;
        }
        Ok(())
    }

    /// Read a table written by [`Trace::write_csv`] or a single file of
    /// [`Trace::write_csv_dir`].
    ///
    /// Statics and derived quantities are not part of the table and come
    /// back empty.
    pub fn read_csv<R: Read>(reader: R) -> Result<Trace> {
        let mut chains = BTreeMap::new();
        read_into(reader, &mut chains)?;
        Ok(chains.into_values().collect_vec().into())
    }

    pub fn read_csv_path<P: AsRef<Path>>(path: P) -> Result<Trace> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
        Self::read_csv(file).with_context(|| format!("Failed to read trace from {:?}", path))
    }

    /// Read every `chain_*.csv` file in `dir`.
    pub fn read_csv_dir<P: AsRef<Path>>(dir: P) -> Result<Trace> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {:?}", dir))?
        {
            let path = entry?.path();
            let is_chain_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("chain_") && name.ends_with(".csv"));
            if is_chain_file {
                paths.push(path);
            }
        }
        paths.sort();

        let mut chains = BTreeMap::new();
        for path in paths {
            let file = File::open(&path)
                .with_context(|| format!("Failed to open CSV file: {:?}", path))?;
            read_into(file, &mut chains)
                .with_context(|| format!("Failed to read trace from {:?}", path))?;
        }
        Ok(chains.into_values().collect_vec().into())
    }
}

fn write_header<W: Write>(writer: &mut csv::Writer<W>, chain: &ChainTrace) -> Result<()> {
    let mut header = vec!["chain".to_string(), "iteration".to_string()];
    header.extend(chain.column_names());
    writer.write_record(&header)?;
    Ok(())
}

fn write_rows<W: Write>(writer: &mut csv::Writer<W>, chain: &ChainTrace) -> Result<()> {
    for draw in chain.draws() {
        let mut row = vec![chain.chain.to_string(), draw.index.to_string()];
        for (_, values) in draw.iter() {
            row.extend(values.iter().map(|v| v.to_string()));
        }
        writer.write_record(&row)?;
    }
    Ok(())
}

/// Split `Betas[3]` into `(Betas, 3)`; scalar columns have no index.
fn parse_column(name: &str) -> Result<(TracedParam, Option<usize>)> {
    match name.split_once('[') {
        Some((param, rest)) => {
            let Some(index) = rest.strip_suffix(']') else {
                bail!("Malformed column name {:?}", name);
            };
            let index = index
                .parse()
                .with_context(|| format!("Malformed column index in {:?}", name))?;
            Ok((param.parse()?, Some(index)))
        }
        None => Ok((name.parse()?, None)),
    }
}

fn read_into<R: Read>(reader: R, chains: &mut BTreeMap<u64, ChainTrace>) -> Result<()> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers().context("Missing CSV header")?.clone();

    let mut columns = headers.iter();
    if columns.next() != Some("chain") || columns.next() != Some("iteration") {
        bail!("CSV trace must start with `chain` and `iteration` columns");
    }

    let mut layout: Vec<(TracedParam, usize)> = Vec::new();
    for name in columns {
        let (param, index) = parse_column(name)?;
        match layout.last_mut() {
            Some((last, width)) if *last == param => {
                if index != Some(*width) {
                    bail!("Column {:?} is out of order", name);
                }
                *width += 1;
            }
            _ => {
                if layout.iter().any(|(seen, _)| *seen == param) {
                    bail!("Columns of {} are not contiguous", param);
                }
                if !matches!(index, None | Some(0)) {
                    bail!("Column {:?} is out of order", name);
                }
                layout.push((param, 1));
            }
        }
    }

    // A core parameter of width zero writes no columns.
    for (rank, param) in TracedParam::CORE.iter().enumerate() {
        if layout.iter().any(|(seen, _)| seen == param) {
            continue;
        }
        let at = layout
            .iter()
            .position(|(seen, _)| !TracedParam::CORE[..=rank].contains(seen))
            .unwrap_or(layout.len());
        layout.insert(at, (*param, 0));
    }

    for record in reader.records() {
        let record = record.context("Failed to read CSV row")?;
        let chain_id: u64 = record
            .get(0)
            .unwrap_or_default()
            .parse()
            .context("Invalid chain index")?;
        let iteration: usize = record
            .get(1)
            .unwrap_or_default()
            .parse()
            .context("Invalid iteration index")?;

        let chain = chains
            .entry(chain_id)
            .or_insert_with(|| ChainTrace::new(chain_id, &layout));
        if chain.layout() != layout {
            bail!("Chain {} has inconsistent columns", chain_id);
        }
        if iteration != chain.len() {
            bail!(
                "Chain {} expected iteration {} but found {}",
                chain_id,
                chain.len(),
                iteration
            );
        }

        let values: Vec<f64> = record
            .iter()
            .skip(2)
            .map(|value| value.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("Invalid value in chain {} iteration {}", chain_id, iteration))?;
        if values.len() != layout.iter().map(|(_, width)| width).sum::<usize>() {
            bail!("Row {} of chain {} has the wrong length", iteration, chain_id);
        }

        let mut offset = 0;
        for trace in chain.params.iter_mut() {
            trace.push(&values[offset..offset + trace.width]);
            offset += trace.width;
        }
    }
    Ok(())
}
