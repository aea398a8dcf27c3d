use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use crate::error::{Result, SqcError};
use crate::ramp::RampSpec;
use crate::switching::RouteRequest;
use crate::types::{Channel, Matrix, Position, Role};
use crate::units::{self, Quantity, Tolerance};
use crate::utils::parse_strips;

fn default_true() -> bool {
    true
}

fn default_interval() -> usize {
    1
}

fn default_n_samples() -> usize {
    5
}

fn zero_volts() -> Quantity {
    Quantity::volts(0.0)
}

fn one_volt() -> Quantity {
    Quantity::volts(1.0)
}

fn five_volts() -> Quantity {
    Quantity::volts(5.0)
}

fn ten_volts() -> Quantity {
    Quantity::volts(10.0)
}

fn minus_five_volts() -> Quantity {
    Quantity::volts(-5.0)
}

fn zero_seconds() -> Quantity {
    Quantity::seconds(0.0)
}

fn one_second() -> Quantity {
    Quantity::seconds(1.0)
}

fn one_kilohertz() -> Quantity {
    Quantity::hertz(1e3)
}

fn one_megahertz() -> Quantity {
    Quantity::hertz(1e6)
}

fn one_microampere() -> Quantity {
    Quantity::amperes(1e-6)
}

fn ten_microamperes() -> Quantity {
    Quantity::amperes(10e-6)
}

fn fifty_microamperes() -> Quantity {
    Quantity::amperes(50e-6)
}

// === Parameters ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IvParams {
    #[serde(with = "units::volts", default = "zero_volts")]
    pub voltage_begin: Quantity,
    #[serde(with = "units::volts")]
    pub voltage_end: Quantity,
    #[serde(with = "units::volts")]
    pub voltage_step: Quantity,
    #[serde(with = "units::seconds", default = "one_second")]
    pub waiting_time: Quantity,
    #[serde(with = "units::amperes")]
    pub compliance: Quantity,
}

impl IvParams {
    pub fn ramp(&self) -> RampSpec {
        RampSpec {
            begin: self.voltage_begin,
            end: self.voltage_end,
            step: self.voltage_step,
            waiting_time: self.waiting_time,
            compliance: Some(self.compliance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CvParams {
    #[serde(with = "units::volts", default = "zero_volts")]
    pub voltage_begin: Quantity,
    #[serde(with = "units::volts")]
    pub voltage_end: Quantity,
    #[serde(with = "units::volts")]
    pub voltage_step: Quantity,
    #[serde(with = "units::seconds", default = "one_second")]
    pub waiting_time: Quantity,
    #[serde(with = "units::amperes")]
    pub compliance: Quantity,
    #[serde(with = "units::volts", default = "one_volt")]
    pub lcr_amplitude: Quantity,
    #[serde(with = "units::hertz", default = "one_kilohertz")]
    pub lcr_frequency: Quantity,
    #[serde(default)]
    pub open_correction: bool,
}

impl CvParams {
    pub fn ramp(&self) -> RampSpec {
        RampSpec {
            begin: self.voltage_begin,
            end: self.voltage_end,
            step: self.voltage_step,
            waiting_time: self.waiting_time,
            compliance: Some(self.compliance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StripscanParams {
    #[serde(with = "units::volts")]
    pub bias_voltage: Quantity,
    #[serde(with = "units::amperes")]
    pub bias_compliance: Quantity,
    /// Step magnitude of the bias ramp; the sign follows the ramp direction
    #[serde(with = "units::volts", default = "ten_volts")]
    pub bias_voltage_step: Quantity,
    #[serde(with = "units::seconds", default = "one_second")]
    pub waiting_time: Quantity,
}

impl StripscanParams {
    pub fn ramp_from(&self, begin: Quantity) -> RampSpec {
        let direction = self.bias_voltage.value() - begin.value();
        RampSpec {
            begin,
            end: self.bias_voltage,
            step: Quantity::volts(self.bias_voltage_step.value().abs().copysign(direction)),
            waiting_time: self.waiting_time,
            compliance: Some(self.bias_compliance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IstripParams {
    #[serde(with = "units::amperes::option", default)]
    pub istrip_i_minimum: Option<Quantity>,
    #[serde(with = "units::amperes::option", default)]
    pub istrip_i_maximum: Option<Quantity>,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpolyParams {
    /// LV channels used for the strip current reading
    #[serde(default)]
    pub lv_channels_istrip: Vec<Channel>,
    #[serde(with = "units::amperes", default = "ten_microamperes")]
    pub smu_compliance: Quantity,
    #[serde(with = "units::volts", default = "minus_five_volts")]
    pub smu_voltage: Quantity,
    #[serde(with = "units::ohms::option", default)]
    pub rpoly_r_minimum: Option<Quantity>,
    #[serde(with = "units::ohms::option", default)]
    pub rpoly_r_maximum: Option<Quantity>,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdielParams {
    #[serde(with = "units::amperes", default = "one_microampere")]
    pub smu_compliance: Quantity,
    #[serde(with = "units::volts", default = "ten_volts")]
    pub smu_voltage: Quantity,
    #[serde(with = "units::amperes::option", default)]
    pub idiel_i_minimum: Option<Quantity>,
    #[serde(with = "units::amperes::option", default)]
    pub idiel_i_maximum: Option<Quantity>,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacParams {
    #[serde(with = "units::volts", default = "one_volt")]
    pub lcr_amplitude: Quantity,
    #[serde(with = "units::hertz", default = "one_kilohertz")]
    pub lcr_frequency: Quantity,
    #[serde(with = "units::farads::option", default)]
    pub cac_cp_minimum: Option<Quantity>,
    #[serde(with = "units::farads::option", default)]
    pub cac_cp_maximum: Option<Quantity>,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CintParams {
    #[serde(with = "units::volts", default = "one_volt")]
    pub lcr_amplitude: Quantity,
    #[serde(with = "units::hertz", default = "one_megahertz")]
    pub lcr_frequency: Quantity,
    #[serde(with = "units::farads::option", default)]
    pub cint_cp_minimum: Option<Quantity>,
    #[serde(with = "units::farads::option", default)]
    pub cint_cp_maximum: Option<Quantity>,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RintParams {
    #[serde(with = "units::volts", default = "zero_volts")]
    pub smu_voltage_begin: Quantity,
    #[serde(with = "units::volts", default = "five_volts")]
    pub smu_voltage_end: Quantity,
    #[serde(with = "units::volts", default = "one_volt")]
    pub smu_voltage_step: Quantity,
    #[serde(with = "units::seconds", default = "zero_seconds")]
    pub smu_waiting_time: Quantity,
    #[serde(with = "units::amperes", default = "fifty_microamperes")]
    pub smu_compliance: Quantity,
    #[serde(with = "units::ohms::option", default)]
    pub rint_r_minimum: Option<Quantity>,
    #[serde(with = "units::ohms::option", default)]
    pub rint_r_maximum: Option<Quantity>,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
}

impl RintParams {
    pub fn ramp(&self) -> RampSpec {
        RampSpec {
            begin: self.smu_voltage_begin,
            end: self.smu_voltage_end,
            step: self.smu_voltage_step,
            waiting_time: self.smu_waiting_time,
            compliance: Some(self.smu_compliance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdarkParams {
    #[serde(with = "units::amperes::option", default)]
    pub idark_i_minimum: Option<Quantity>,
    #[serde(with = "units::amperes::option", default)]
    pub idark_i_maximum: Option<Quantity>,
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
}

/// Measurement type together with its typed parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "parameters", rename_all = "lowercase")]
pub enum NodeKind {
    Stripscan(StripscanParams),
    Iv(IvParams),
    Cv(CvParams),
    Istrip(IstripParams),
    Idiel(IdielParams),
    Idark(IdarkParams),
    Rint(RintParams),
    Rpoly(RpolyParams),
    Cint(CintParams),
    Cac(CacParams),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Stripscan(_) => "stripscan",
            NodeKind::Iv(_) => "iv",
            NodeKind::Cv(_) => "cv",
            NodeKind::Istrip(_) => "istrip",
            NodeKind::Idiel(_) => "idiel",
            NodeKind::Idark(_) => "idark",
            NodeKind::Rint(_) => "rint",
            NodeKind::Rpoly(_) => "rpoly",
            NodeKind::Cint(_) => "cint",
            NodeKind::Cac(_) => "cac",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Stripscan(_))
    }

    /// Leaves measured once per contacted strip
    pub fn is_strip_leaf(&self) -> bool {
        matches!(
            self,
            NodeKind::Istrip(_)
                | NodeKind::Idiel(_)
                | NodeKind::Idark(_)
                | NodeKind::Rint(_)
                | NodeKind::Rpoly(_)
                | NodeKind::Cint(_)
                | NodeKind::Cac(_)
        )
    }

    /// Roles owning the `hv_channels` and `lv_channels` lists when no explicit routes are given
    pub fn default_roles(&self) -> (Role, Role) {
        match self {
            NodeKind::Stripscan(_) | NodeKind::Iv(_) | NodeKind::Idark(_) => (Role::Bias, Role::Bias),
            NodeKind::Cv(_) | NodeKind::Cint(_) | NodeKind::Cac(_) => (Role::Bias, Role::Lcr),
            NodeKind::Istrip(_) => (Role::Bias, Role::Elm),
            NodeKind::Idiel(_) | NodeKind::Rpoly(_) | NodeKind::Rint(_) => (Role::Bias, Role::Smu),
        }
    }

    /// Acceptance window of the primary output
    pub fn tolerance(&self) -> Tolerance {
        match self {
            NodeKind::Istrip(p) => Tolerance::new(p.istrip_i_minimum, p.istrip_i_maximum),
            NodeKind::Idiel(p) => Tolerance::new(p.idiel_i_minimum, p.idiel_i_maximum),
            NodeKind::Idark(p) => Tolerance::new(p.idark_i_minimum, p.idark_i_maximum),
            NodeKind::Rint(p) => Tolerance::new(p.rint_r_minimum, p.rint_r_maximum),
            NodeKind::Rpoly(p) => Tolerance::new(p.rpoly_r_minimum, p.rpoly_r_maximum),
            NodeKind::Cint(p) => Tolerance::new(p.cint_cp_minimum, p.cint_cp_maximum),
            NodeKind::Cac(p) => Tolerance::new(p.cac_cp_minimum, p.cac_cp_maximum),
            NodeKind::Stripscan(_) | NodeKind::Iv(_) | NodeKind::Cv(_) => Tolerance::unbounded(),
        }
    }

    /// Whether the node needs an LCR open correction before the sequence starts
    pub fn needs_open_correction(&self) -> bool {
        match self {
            NodeKind::Cac(_) | NodeKind::Cint(_) => true,
            NodeKind::Cv(p) => p.open_correction,
            _ => false,
        }
    }

    fn from_parameters(type_name: &str, name: &str, parameters: toml::Table) -> Result<NodeKind> {
        fn parse<T: serde::de::DeserializeOwned>(name: &str, parameters: toml::Table) -> Result<T> {
            toml::Value::Table(parameters)
                .try_into()
                .map_err(|e| SqcError::Configuration(format!("invalid parameters for {name:?}: {e}")))
        }

        Ok(match type_name {
            "stripscan" => NodeKind::Stripscan(parse(name, parameters)?),
            "iv" => NodeKind::Iv(parse(name, parameters)?),
            "cv" => NodeKind::Cv(parse(name, parameters)?),
            "istrip" => NodeKind::Istrip(parse(name, parameters)?),
            "idiel" => NodeKind::Idiel(parse(name, parameters)?),
            "idark" => NodeKind::Idark(parse(name, parameters)?),
            "rint" => NodeKind::Rint(parse(name, parameters)?),
            "rpoly" => NodeKind::Rpoly(parse(name, parameters)?),
            "cint" => NodeKind::Cint(parse(name, parameters)?),
            "cac" => NodeKind::Cac(parse(name, parameters)?),
            other => {
                return Err(SqcError::Configuration(format!(
                    "unknown measurement type {other:?} for {name:?}"
                )));
            }
        })
    }
}

/// Switch routing of a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Routing {
    #[serde(default)]
    pub hv_channels: Vec<Channel>,
    #[serde(default)]
    pub lv_channels: Vec<Channel>,
    /// Explicit role attribution, replacing the channel lists
    #[serde(default)]
    pub routes: Option<BTreeMap<Matrix, BTreeMap<Role, Vec<Channel>>>>,
}

impl Routing {
    const KEYS: [&'static str; 3] = ["hv_channels", "lv_channels", "routes"];

    pub fn request(&self, kind: &NodeKind) -> RouteRequest {
        match &self.routes {
            Some(routes) => routes
                .iter()
                .flat_map(|(matrix, roles)| {
                    roles
                        .iter()
                        .map(move |(role, channels)| (*matrix, *role, channels))
                })
                .fold(RouteRequest::new(), |request, (matrix, role, channels)| {
                    request.route(matrix, role, channels.iter().cloned())
                }),
            None => {
                let (hv_role, lv_role) = kind.default_roles();
                RouteRequest::new()
                    .route(Matrix::Hv, hv_role, self.hv_channels.iter().cloned())
                    .route(Matrix::Lv, lv_role, self.lv_channels.iter().cloned())
            }
        }
    }

    /// Second routing of rpoly: LV rerouted to the electrometer for the strip current
    pub fn istrip_request(&self, kind: &NodeKind, lv_channels_istrip: &[Channel]) -> RouteRequest {
        let hv_role = kind.default_roles().0;
        let hv: Vec<Channel> = match &self.routes {
            Some(routes) => routes
                .get(&Matrix::Hv)
                .and_then(|roles| roles.get(&hv_role))
                .cloned()
                .unwrap_or_default(),
            None => self.hv_channels.clone(),
        };
        RouteRequest::new()
            .route(Matrix::Hv, hv_role, hv)
            .route(Matrix::Lv, Role::Elm, lv_channels_istrip.iter().cloned())
    }
}

/// Raw `[[measurements]]` entry as written in the sequence file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_disable: bool,
    #[serde(default = "default_interval")]
    pub interval: usize,
    #[serde(default)]
    pub strips: String,
    #[serde(default)]
    pub parameters: toml::Table,
    #[serde(default)]
    pub strip_measurements: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub measurements: Vec<NodeConfig>,
}

/// One node of the measurement tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceNode {
    pub name: String,
    pub enabled: bool,
    pub auto_disable: bool,
    pub interval: usize,
    pub strips: String,
    pub routing: Routing,
    pub kind: NodeKind,
    pub children: Vec<SequenceNode>,
}

impl SequenceNode {
    fn from_config(config: NodeConfig) -> Result<Self> {
        let NodeConfig {
            kind,
            name,
            enabled,
            auto_disable,
            interval,
            strips,
            mut parameters,
            strip_measurements,
        } = config;

        let mut routing_table = toml::Table::new();
        for key in Routing::KEYS {
            if let Some(value) = parameters.remove(key) {
                routing_table.insert(key.to_string(), value);
            }
        }
        let routing: Routing = toml::Value::Table(routing_table)
            .try_into()
            .map_err(|e| SqcError::Configuration(format!("invalid routing for {name:?}: {e}")))?;

        let kind = NodeKind::from_parameters(&kind, &name, parameters)?;
        let children = strip_measurements
            .into_iter()
            .map(SequenceNode::from_config)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name,
            enabled,
            auto_disable,
            interval,
            strips,
            routing,
            kind,
            children,
        })
    }

    pub fn route_request(&self) -> RouteRequest {
        self.routing.request(&self.kind)
    }
}

/// Validated measurement tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sequence {
    pub name: Option<String>,
    pub nodes: Vec<SequenceNode>,
}

impl Sequence {
    pub fn from_config(config: SequenceConfig) -> Result<Self> {
        let nodes = config
            .measurements
            .into_iter()
            .map(SequenceNode::from_config)
            .collect::<Result<Vec<_>>>()?;
        let sequence = Self {
            name: config.name,
            nodes,
        };
        sequence.validate_structure()?;
        Ok(sequence)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SequenceConfig = toml::from_str(text)
            .map_err(|e| SqcError::Configuration(format!("invalid sequence: {e}")))?;
        Self::from_config(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SqcError::Configuration(format!("cannot read sequence {}: {e}", path.display()))
        })?;
        let sequence = Self::from_toml_str(&text)?;
        debug!(
            "Loaded sequence {} with {} top level measurements",
            path.display(),
            sequence.nodes.len()
        );
        Ok(sequence)
    }

    fn validate_structure(&self) -> Result<()> {
        check_unique_names(&self.nodes, "sequence")?;
        for node in &self.nodes {
            if node.kind.is_strip_leaf() {
                return Err(SqcError::Configuration(format!(
                    "{} measurement {:?} must be placed inside a stripscan",
                    node.kind.type_name(),
                    node.name
                )));
            }
            if !node.kind.is_container() && !node.children.is_empty() {
                return Err(SqcError::Configuration(format!(
                    "{} measurement {:?} cannot have strip measurements",
                    node.kind.type_name(),
                    node.name
                )));
            }
            check_interval(node)?;
            match &node.kind {
                NodeKind::Iv(p) => check_ramp(&node.name, &p.ramp())?,
                NodeKind::Cv(p) => check_ramp(&node.name, &p.ramp())?,
                _ => {}
            }

            check_unique_names(&node.children, &node.name)?;
            for child in &node.children {
                if !child.kind.is_strip_leaf() {
                    return Err(SqcError::Configuration(format!(
                        "{} measurement {:?} is not allowed inside stripscan {:?}",
                        child.kind.type_name(),
                        child.name,
                        node.name
                    )));
                }
                if !child.children.is_empty() {
                    return Err(SqcError::Configuration(format!(
                        "strip measurement {:?} cannot have children",
                        child.name
                    )));
                }
                check_interval(child)?;
                if let NodeKind::Rint(p) = &child.kind {
                    check_ramp(&child.name, &p.ramp())?;
                }
                if let NodeKind::Rpoly(p) = &child.kind {
                    if p.lv_channels_istrip.is_empty() && !child.routing.lv_channels.is_empty() {
                        return Err(SqcError::Configuration(format!(
                            "rpoly {:?} requires lv_channels_istrip",
                            child.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks every strip expression against the layout
    pub fn validate_against(&self, layout: &StripLayout) -> Result<()> {
        let names = layout.names();
        for node in &self.nodes {
            for n in std::iter::once(node).chain(node.children.iter()) {
                parse_strips(&names, &n.strips).map_err(|e| {
                    SqcError::Configuration(format!(
                        "invalid strips expression for {:?}: {e}",
                        n.name
                    ))
                })?;
            }
        }
        Ok(())
    }

    pub fn find(&self, path: &str) -> Option<&SequenceNode> {
        let mut parts = path.split('/');
        let top = parts.next()?;
        let node = self.nodes.iter().find(|n| n.name == top)?;
        match parts.next() {
            None => Some(node),
            Some(child) => node.children.iter().find(|c| c.name == child),
        }
    }
}

fn check_interval(node: &SequenceNode) -> Result<()> {
    if node.interval < 1 {
        return Err(SqcError::Configuration(format!(
            "invalid interval for {:?}: {}",
            node.name, node.interval
        )));
    }
    Ok(())
}

fn check_ramp(name: &str, spec: &RampSpec) -> Result<()> {
    spec.points()
        .map(|_| ())
        .map_err(|e| SqcError::Configuration(format!("{name:?}: {e}")))
}

fn check_unique_names(nodes: &[SequenceNode], scope: &str) -> Result<()> {
    let mut seen = BTreeSet::new();
    for node in nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(SqcError::Configuration(format!(
                "duplicate measurement name {:?} in {scope}",
                node.name
            )));
        }
    }
    Ok(())
}

/// Contact pad of one strip, positions in micrometres
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StripPad {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Pads that cannot be contacted are skipped
    #[serde(default = "default_true")]
    pub contact: bool,
}

impl StripPad {
    pub fn position(&self) -> Position {
        Position::new(self.x, self.y, self.z)
    }
}

/// Ordered strips of the sensor under test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StripLayout {
    #[serde(default)]
    pub sensor: Option<String>,
    pub strips: Vec<StripPad>,
}

impl StripLayout {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let layout: StripLayout = toml::from_str(text)
            .map_err(|e| SqcError::Configuration(format!("invalid strip layout: {e}")))?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SqcError::Configuration(format!("cannot read strip layout {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.strips.is_empty() {
            return Err(SqcError::Configuration("strip layout is empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        for strip in &self.strips {
            if !seen.insert(strip.name.as_str()) {
                return Err(SqcError::Configuration(format!(
                    "duplicate strip {:?} in layout",
                    strip.name
                )));
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.strips.iter().map(|s| s.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.strips.iter().position(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&StripPad> {
        self.strips.iter().find(|s| s.name == name)
    }

    /// Evenly spaced strips `P1..Pn` along X, mostly for tests and simulation
    pub fn linear(count: usize, pitch: f64, z: f64) -> Self {
        Self {
            sensor: None,
            strips: (1..=count)
                .map(|i| StripPad {
                    name: format!("P{i}"),
                    x: 1000.0 + pitch * (i - 1) as f64,
                    y: 1000.0,
                    z,
                    contact: true,
                })
                .collect(),
        }
    }
}
