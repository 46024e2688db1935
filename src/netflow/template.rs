use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use super::FieldSpec;

/// Identifies a template within an exporter's namespace
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct TemplateKey {
    pub exporter: IpAddr,
    pub obs_domain_id: u32,
    pub template_id: u16,
}

impl TemplateKey {
    pub fn new(exporter: IpAddr, obs_domain_id: u32, template_id: u16) -> Self {
        Self {
            exporter,
            obs_domain_id,
            template_id,
        }
    }
}

/// Field layout announced by a Template FlowSet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTemplate {
    pub fields: Vec<FieldSpec>,
}

impl DataTemplate {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Bytes consumed by one data record
    pub fn record_length(&self) -> usize {
        record_length(&self.fields)
    }
}

/// Field layout announced by an Options Template FlowSet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsTemplate {
    pub scope_fields: Vec<FieldSpec>,
    pub option_fields: Vec<FieldSpec>,
}

impl OptionsTemplate {
    pub fn new(scope_fields: Vec<FieldSpec>, option_fields: Vec<FieldSpec>) -> Self {
        Self {
            scope_fields,
            option_fields,
        }
    }

    pub fn scope_length(&self) -> usize {
        record_length(&self.scope_fields)
    }

    /// Bytes consumed by one options data record, scope and options together
    pub fn record_length(&self) -> usize {
        self.scope_length() + record_length(&self.option_fields)
    }
}

fn record_length(fields: &[FieldSpec]) -> usize {
    fields.iter().map(|f| f.length as usize).sum()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    Data(Arc<DataTemplate>),
    Options(Arc<OptionsTemplate>),
}

impl Template {
    /// Label used for the template gauge
    pub fn kind(&self) -> &'static str {
        match self {
            Template::Data(_) => "template",
            Template::Options(_) => "options_template",
        }
    }

    pub fn record_length(&self) -> usize {
        match self {
            Template::Data(t) => t.record_length(),
            Template::Options(t) => t.record_length(),
        }
    }
}

/// Subject an options data record applies to
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum OptionsScope {
    /// The whole observation domain
    Domain,
    /// A single sampler, identified by its sampler or selector id
    Sampler(u64),
}

/// Sampler-scoped sampling rates kept per exporter unless configured otherwise
pub const DEFAULT_MAX_SAMPLERS_PER_EXPORTER: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("exporter {exporter} already holds {limit} templates")]
    LimitReached { exporter: IpAddr, limit: usize },
    #[error("exporter {exporter} already holds {limit} sampler rates")]
    SamplerLimitReached { exporter: IpAddr, limit: usize },
}

/// Resolved sampling rates of one exporter
#[derive(Debug, Default)]
struct Scalars {
    rates: HashMap<(u32, OptionsScope), u64>,
    /// Number of `OptionsScope::Sampler` keys in `rates`
    samplers: usize,
}

/// State kept for a single exporter
#[derive(Debug, Default)]
struct ExporterState {
    templates: RwLock<HashMap<(u32, u16), Template>>,
    scalars: RwLock<Scalars>,
}

/// Template and options scalar cache, sharded per exporter.
///
/// Entries never expire; exporters re-announce their templates periodically
/// and a redefinition replaces the previous layout. Sampler ids come straight
/// off the wire, so sampler-scoped rates are always bounded per exporter.
#[derive(Debug)]
pub struct TemplateCache {
    exporters: RwLock<HashMap<IpAddr, Arc<ExporterState>>>,
    max_templates_per_exporter: Option<usize>,
    max_samplers_per_exporter: usize,
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self {
            exporters: RwLock::new(HashMap::new()),
            max_templates_per_exporter: None,
            max_samplers_per_exporter: DEFAULT_MAX_SAMPLERS_PER_EXPORTER,
        }
    }
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of distinct templates a single exporter may register
    pub fn with_limit(max_templates_per_exporter: Option<usize>) -> Self {
        Self {
            max_templates_per_exporter,
            ..Self::default()
        }
    }

    /// Bound the number of distinct sampler ids a single exporter may announce
    /// rates for. Domain-wide rates are not counted.
    pub fn with_sampler_limit(mut self, max_samplers_per_exporter: usize) -> Self {
        self.max_samplers_per_exporter = max_samplers_per_exporter;
        self
    }

    fn exporter(&self, exporter: IpAddr) -> Option<Arc<ExporterState>> {
        self.exporters.read().get(&exporter).cloned()
    }

    fn get_or_create_exporter(&self, exporter: IpAddr) -> Arc<ExporterState> {
        if let Some(state) = self.exporter(exporter) {
            return state;
        }
        let mut exporters = self.exporters.write();
        exporters.entry(exporter).or_default().clone()
    }

    pub fn put_data_template(&self, key: TemplateKey, fields: Vec<FieldSpec>) -> Result<(), CacheError> {
        self.put(key, Template::Data(Arc::new(DataTemplate::new(fields))))
    }

    pub fn put_options_template(
        &self,
        key: TemplateKey,
        scope_fields: Vec<FieldSpec>,
        option_fields: Vec<FieldSpec>,
    ) -> Result<(), CacheError> {
        let template = OptionsTemplate::new(scope_fields, option_fields);
        self.put(key, Template::Options(Arc::new(template)))
    }

    fn put(&self, key: TemplateKey, template: Template) -> Result<(), CacheError> {
        let state = self.get_or_create_exporter(key.exporter);
        let mut templates = state.templates.write();
        let slot = (key.obs_domain_id, key.template_id);

        if let Some(limit) = self.max_templates_per_exporter {
            if !templates.contains_key(&slot) && templates.len() >= limit {
                return Err(CacheError::LimitReached {
                    exporter: key.exporter,
                    limit,
                });
            }
        }

        templates.insert(slot, template);
        Ok(())
    }

    pub fn get_template(&self, key: &TemplateKey) -> Option<Template> {
        let state = self.exporter(key.exporter)?;
        let templates = state.templates.read();
        templates.get(&(key.obs_domain_id, key.template_id)).cloned()
    }

    /// Number of templates currently held for an exporter
    pub fn template_count(&self, exporter: IpAddr) -> usize {
        self.exporter(exporter)
            .map(|state| state.templates.read().len())
            .unwrap_or(0)
    }

    /// Store a sampling rate. A rate for a sampler id not seen before is
    /// refused once the exporter reached its sampler limit; known keys are
    /// always updated.
    pub fn put_options_scalar(
        &self,
        exporter: IpAddr,
        obs_domain_id: u32,
        scope: OptionsScope,
        sampling_rate: u64,
    ) -> Result<(), CacheError> {
        let state = self.get_or_create_exporter(exporter);
        let mut scalars = state.scalars.write();
        let key = (obs_domain_id, scope);

        if let Some(rate) = scalars.rates.get_mut(&key) {
            *rate = sampling_rate;
            return Ok(());
        }
        if let OptionsScope::Sampler(_) = scope {
            if scalars.samplers >= self.max_samplers_per_exporter {
                return Err(CacheError::SamplerLimitReached {
                    exporter,
                    limit: self.max_samplers_per_exporter,
                });
            }
            scalars.samplers += 1;
        }
        scalars.rates.insert(key, sampling_rate);
        Ok(())
    }

    pub fn get_options_scalar(&self, exporter: IpAddr, obs_domain_id: u32, scope: OptionsScope) -> Option<u64> {
        let state = self.exporter(exporter)?;
        let scalars = state.scalars.read();
        scalars.rates.get(&(obs_domain_id, scope)).copied()
    }

    /// Number of sampling rates currently held for an exporter
    pub fn scalar_count(&self, exporter: IpAddr) -> usize {
        self.exporter(exporter)
            .map(|state| state.scalars.read().rates.len())
            .unwrap_or(0)
    }
}
