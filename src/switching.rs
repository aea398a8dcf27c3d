use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SqcError};
use crate::instrument::SwitchMatrix;
use crate::types::{Channel, Matrix, Role};

/// Channels each role wants closed, per matrix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteRequest {
    routes: BTreeMap<Matrix, Vec<(Role, BTreeSet<Channel>)>>,
}

impl RouteRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route; the same channel requested by two roles is rejected by the resolver
    pub fn route<I, C>(mut self, matrix: Matrix, role: Role, channels: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Channel>,
    {
        let channels: BTreeSet<Channel> = channels.into_iter().map(Into::into).collect();
        if !channels.is_empty() {
            self.routes.entry(matrix).or_default().push((role, channels));
        }
        self
    }

    pub fn routes(&self, matrix: Matrix) -> &[(Role, BTreeSet<Channel>)] {
        self.routes.get(&matrix).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.routes.values().all(Vec::is_empty)
    }

    /// Takes over the routes of `parent` on `matrix` when this request has none there
    pub fn inherit(mut self, matrix: Matrix, parent: &RouteRequest) -> Self {
        if self.routes(matrix).is_empty() && !parent.routes(matrix).is_empty() {
            self.routes.insert(matrix, parent.routes(matrix).to_vec());
        }
        self
    }
}

/// Closed channels and their owning role, per matrix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwitchingState {
    closed: BTreeMap<Matrix, BTreeMap<Channel, Role>>,
}

impl SwitchingState {
    pub fn closed(&self, matrix: Matrix) -> BTreeSet<Channel> {
        self.closed
            .get(&matrix)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owner(&self, matrix: Matrix, channel: &Channel) -> Option<Role> {
        self.closed.get(&matrix).and_then(|m| m.get(channel)).copied()
    }

    pub fn channels(&self, matrix: Matrix) -> impl Iterator<Item = (&Channel, &Role)> {
        self.closed.get(&matrix).into_iter().flat_map(|m| m.iter())
    }

    pub fn is_all_open(&self) -> bool {
        self.closed.values().all(BTreeMap::is_empty)
    }

    fn matrix_mut(&mut self, matrix: Matrix) -> &mut BTreeMap<Channel, Role> {
        self.closed.entry(matrix).or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SwitchStep {
    OpenAll(Matrix),
    Open(Matrix, BTreeSet<Channel>),
    Close(Matrix, BTreeMap<Channel, Role>),
}

impl SwitchStep {
    pub fn matrix(&self) -> Matrix {
        match self {
            SwitchStep::OpenAll(m) | SwitchStep::Open(m, _) | SwitchStep::Close(m, _) => *m,
        }
    }
}

/// Ordered switching operations taking the current state to the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchingPlan {
    pub steps: Vec<SwitchStep>,
    pub target: SwitchingState,
}

impl SwitchingPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub struct SwitchingResolver;

impl SwitchingResolver {
    /// Computes the plan from `current` to the closure set described by `request`.
    ///
    /// Matrices without routes in the request end up fully open. A matrix in
    /// which any requested channel is currently owned by a different role is
    /// opened completely before the target set is closed.
    pub fn resolve(current: &SwitchingState, request: &RouteRequest) -> Result<SwitchingPlan> {
        let mut target = SwitchingState::default();
        let mut steps = Vec::new();

        for matrix in Matrix::ALL {
            let mut wanted: BTreeMap<Channel, Role> = BTreeMap::new();
            for (role, channels) in request.routes(matrix) {
                for channel in channels {
                    match wanted.get(channel) {
                        Some(&first) if first != *role => {
                            return Err(SqcError::RoutingConflict {
                                channel: channel.clone(),
                                first,
                                second: *role,
                            });
                        }
                        _ => {
                            wanted.insert(channel.clone(), *role);
                        }
                    }
                }
            }

            let reassigned = wanted.iter().any(|(channel, role)| {
                current
                    .owner(matrix, channel)
                    .is_some_and(|owner| owner != *role)
            });

            if reassigned {
                steps.push(SwitchStep::OpenAll(matrix));
                if !wanted.is_empty() {
                    steps.push(SwitchStep::Close(matrix, wanted.clone()));
                }
            } else {
                let removed: BTreeSet<Channel> = current
                    .channels(matrix)
                    .filter(|(channel, _)| !wanted.contains_key(*channel))
                    .map(|(channel, _)| channel.clone())
                    .collect();
                let added: BTreeMap<Channel, Role> = wanted
                    .iter()
                    .filter(|(channel, _)| current.owner(matrix, channel).is_none())
                    .map(|(channel, role)| (channel.clone(), *role))
                    .collect();
                if !removed.is_empty() {
                    steps.push(SwitchStep::Open(matrix, removed));
                }
                if !added.is_empty() {
                    steps.push(SwitchStep::Close(matrix, added));
                }
            }

            if !wanted.is_empty() {
                *target.matrix_mut(matrix) = wanted;
            }
        }

        Ok(SwitchingPlan { steps, target })
    }
}

/// HV and LV matrices together with the tracked switching state
pub struct Switchboard {
    hv: Box<dyn SwitchMatrix>,
    lv: Box<dyn SwitchMatrix>,
    state: SwitchingState,
    transitions: Vec<SwitchingState>,
}

impl Switchboard {
    pub fn new(hv: Box<dyn SwitchMatrix>, lv: Box<dyn SwitchMatrix>) -> Self {
        Self {
            hv,
            lv,
            state: SwitchingState::default(),
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> &SwitchingState {
        &self.state
    }

    /// Every intermediate state reached since construction
    pub fn transitions(&self) -> &[SwitchingState] {
        &self.transitions
    }

    fn matrix(&mut self, matrix: Matrix) -> &mut dyn SwitchMatrix {
        match matrix {
            Matrix::Hv => self.hv.as_mut(),
            Matrix::Lv => self.lv.as_mut(),
        }
    }

    /// Resolves and executes `request`, returning the executed plan
    pub fn apply(&mut self, request: &RouteRequest) -> Result<SwitchingPlan> {
        let plan = SwitchingResolver::resolve(&self.state, request)?;
        if plan.is_empty() {
            debug!("Switching unchanged");
            return Ok(plan);
        }

        let previous = self.state.clone();
        for step in &plan.steps {
            self.execute(step)?;
        }
        self.verify()?;

        for matrix in Matrix::ALL {
            let before = previous.closed(matrix);
            let after = self.state.closed(matrix);
            if before != after {
                info!(
                    "{} switching: [{}] -> [{}]",
                    matrix,
                    format_channels(&before),
                    format_channels(&after)
                );
            }
        }
        Ok(plan)
    }

    fn execute(&mut self, step: &SwitchStep) -> Result<()> {
        let matrix = step.matrix();
        match step {
            SwitchStep::OpenAll(_) => {
                self.matrix(matrix).open_all()?;
                self.state.matrix_mut(matrix).clear();
            }
            SwitchStep::Open(_, channels) => {
                self.matrix(matrix).open_channels(channels)?;
                let closed = self.state.matrix_mut(matrix);
                for channel in channels {
                    closed.remove(channel);
                }
            }
            SwitchStep::Close(_, channels) => {
                let set: BTreeSet<Channel> = channels.keys().cloned().collect();
                self.matrix(matrix).close_channels(&set)?;
                let closed = self.state.matrix_mut(matrix);
                for (channel, role) in channels {
                    closed.insert(channel.clone(), *role);
                }
            }
        }
        self.transitions.push(self.state.clone());
        Ok(())
    }

    fn verify(&mut self) -> Result<()> {
        for matrix in Matrix::ALL {
            let expected = self.state.closed(matrix);
            let actual = self.matrix(matrix).closed_channels()?;
            if expected != actual {
                return Err(SqcError::Instrument(format!(
                    "{} switching read-back mismatch: expected [{}], got [{}]",
                    matrix,
                    format_channels(&expected),
                    format_channels(&actual)
                )));
            }
        }
        Ok(())
    }

    /// Opens every channel of both matrices
    pub fn release_all(&mut self) -> Result<()> {
        for matrix in Matrix::ALL {
            self.matrix(matrix).open_all()?;
        }
        if !self.state.is_all_open() {
            info!("Opened all switching channels");
        }
        self.state = SwitchingState::default();
        self.transitions.push(self.state.clone());
        Ok(())
    }
}

pub fn format_channels(channels: &BTreeSet<Channel>) -> String {
    channels
        .iter()
        .map(Channel::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimSwitchMatrix, SwitchOp};

    fn board() -> (Switchboard, SimSwitchMatrix, SimSwitchMatrix) {
        let hv = SimSwitchMatrix::new();
        let lv = SimSwitchMatrix::new();
        let board = Switchboard::new(Box::new(hv.clone()), Box::new(lv.clone()));
        (board, hv, lv)
    }

    fn istrip_request() -> RouteRequest {
        RouteRequest::new()
            .route(Matrix::Hv, Role::Bias, ["A1", "B1"])
            .route(Matrix::Lv, Role::Elm, ["1C05"])
    }

    #[test]
    fn test_conflicting_roles_rejected() {
        let request = RouteRequest::new()
            .route(Matrix::Hv, Role::Bias, ["A1"])
            .route(Matrix::Hv, Role::Lcr, ["A1"]);
        let result = SwitchingResolver::resolve(&SwitchingState::default(), &request);
        assert!(matches!(
            result,
            Err(SqcError::RoutingConflict {
                first: Role::Bias,
                second: Role::Lcr,
                ..
            })
        ));
    }

    #[test]
    fn test_inherit_fills_only_missing_matrix() {
        let parent = RouteRequest::new().route(Matrix::Hv, Role::Bias, ["A1"]);
        let child = RouteRequest::new()
            .route(Matrix::Lv, Role::Elm, ["1C05"])
            .inherit(Matrix::Hv, &parent);
        assert_eq!(child.routes(Matrix::Hv), parent.routes(Matrix::Hv));

        let own = RouteRequest::new()
            .route(Matrix::Hv, Role::Lcr, ["B1"])
            .inherit(Matrix::Hv, &parent);
        assert_eq!(own.routes(Matrix::Hv).len(), 1);
        assert_eq!(own.routes(Matrix::Hv)[0].0, Role::Lcr);
    }

    #[test]
    fn test_same_request_twice_is_empty() {
        let (mut board, hv, _lv) = board();
        let first = board.apply(&istrip_request()).unwrap();
        assert!(!first.is_empty());
        let ops = hv.operations().len();

        let second = board.apply(&istrip_request()).unwrap();
        assert!(second.is_empty());
        assert_eq!(hv.operations().len(), ops);
    }

    #[test]
    fn test_open_before_close_for_disjoint_change() {
        let (mut board, _hv, lv) = board();
        board.apply(&istrip_request()).unwrap();
        let request = RouteRequest::new()
            .route(Matrix::Hv, Role::Bias, ["A1", "B1"])
            .route(Matrix::Lv, Role::Elm, ["1C06"]);
        let plan = board.apply(&request).unwrap();
        assert_eq!(
            plan.steps,
            vec![
                SwitchStep::Open(Matrix::Lv, BTreeSet::from([Channel::from("1C05")])),
                SwitchStep::Close(
                    Matrix::Lv,
                    BTreeMap::from([(Channel::from("1C06"), Role::Elm)])
                ),
            ]
        );
        assert_eq!(lv.closed(), BTreeSet::from([Channel::from("1C06")]));
    }

    #[test]
    fn test_owner_change_passes_through_all_open() {
        let (mut board, _hv, lv) = board();
        board.apply(&istrip_request()).unwrap();
        let request = RouteRequest::new()
            .route(Matrix::Hv, Role::Bias, ["A1", "B1"])
            .route(Matrix::Lv, Role::Smu, ["1C05", "2C05"]);
        let plan = board.apply(&request).unwrap();
        assert_eq!(plan.steps[0], SwitchStep::OpenAll(Matrix::Lv));
        assert!(matches!(
            lv.operations().last(),
            Some(SwitchOp::Close(channels)) if channels.len() == 2
        ));
        assert_eq!(board.state().owner(Matrix::Lv, &"1C05".into()), Some(Role::Smu));
    }

    #[test]
    fn test_no_channel_changes_owner_directly() {
        let (mut board, _hv, _lv) = board();
        let requests = [
            istrip_request(),
            RouteRequest::new()
                .route(Matrix::Hv, Role::Smu, ["A1"])
                .route(Matrix::Lv, Role::Smu, ["1C05"]),
            RouteRequest::new().route(Matrix::Hv, Role::Lcr, ["A1", "C3"]),
            istrip_request(),
        ];
        for request in &requests {
            board.apply(request).unwrap();
        }
        board.release_all().unwrap();

        let mut previous = SwitchingState::default();
        for state in board.transitions() {
            for matrix in Matrix::ALL {
                for (channel, role) in state.channels(matrix) {
                    if let Some(old) = previous.owner(matrix, channel) {
                        assert_eq!(old, *role, "{channel} changed owner while closed");
                    }
                }
            }
            previous = state.clone();
        }
        assert!(board.state().is_all_open());
    }

    #[test]
    fn test_read_back_mismatch_fails() {
        let (mut board, hv, _lv) = board();
        hv.stick_open("B1");
        let result = board.apply(&istrip_request());
        assert!(matches!(result, Err(SqcError::Instrument(_))));
    }
}
