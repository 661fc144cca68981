//! Rolling-contact model: a ball riding a spinning turntable, coupled
//! through viscous slip friction and advanced by a truncated Taylor
//! expansion.
//!
//! The model is wired into the expression graph once, in two phases: first
//! the leaf variables and the friction expression, then the derivative
//! wiring that turns the leaves into an ODE system (position integrates
//! velocity, each rate variable carries its own right-hand side as its
//! derivative). The first/second/third-order derivative trees of the three
//! rate variables are precomputed at construction; `tick` only evaluates
//! them and writes new leaf values back through the mutators, which is what
//! keeps every sub-step's evaluation fresh.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{Expr3Id, Graph, Var3Id};

/// Physical and integration parameters for the turntable model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SphereParams {
    /// Ball mass.
    pub mass: f64,
    /// Ball radius; also sets the contact offset below the ball center.
    pub radius: f64,
    /// Moment of inertia of the turntable about its spin axis.
    pub table_inertia: f64,
    /// Viscous gain coupling contact slip to friction force.
    pub slip_gain: f64,
    /// Upper clamp applied to a single `tick` request.
    pub max_step: f64,
    /// Sub-step resolution: sub-steps per unit of clamped time.
    pub substep_rate: f64,
}

impl Default for SphereParams {
    fn default() -> Self {
        Self {
            mass: 2.0,
            radius: 2.0,
            table_inertia: 5.0,
            slip_gain: 300.0,
            max_step: 0.2,
            substep_rate: 10_000.0,
        }
    }
}

impl SphereParams {
    /// Hollow-sphere moment of inertia of the ball, `2/3 m r^2`.
    pub fn ball_inertia(&self) -> f64 {
        2.0 / 3.0 * self.mass * self.radius * self.radius
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        let positive = [
            ("mass", self.mass),
            ("radius", self.radius),
            ("table_inertia", self.table_inertia),
            ("max_step", self.max_step),
            ("substep_rate", self.substep_rate),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ParamError { name, value });
            }
        }
        if !(self.slip_gain.is_finite() && self.slip_gain >= 0.0) {
            return Err(ParamError {
                name: "slip_gain",
                value: self.slip_gain,
            });
        }
        Ok(())
    }
}

/// Rejected model parameter.
#[derive(Debug, Clone, Copy, Error)]
#[error("invalid {name}: {value} is out of range")]
pub struct ParamError {
    pub name: &'static str,
    pub value: f64,
}

/// Initial kinematic state of the leaves. The two rotation accumulators
/// always start at zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InitialState {
    /// Contact-frame position of the ball.
    pub position: Vector3<f64>,
    /// Ball velocity.
    pub velocity: Vector3<f64>,
    /// Turntable angular velocity.
    pub table_spin: Vector3<f64>,
    /// Ball angular velocity.
    pub ball_spin: Vector3<f64>,
}

impl Default for InitialState {
    fn default() -> Self {
        Self {
            position: Vector3::new(0.0, 3.0, 0.0),
            velocity: Vector3::new(-3.2, 0.0, 0.0),
            table_spin: Vector3::new(0.0, 0.0, 3.0),
            ball_spin: Vector3::zeros(),
        }
    }
}

/// The wired model: six vector leaves, the slip-friction expression, and the
/// precomputed derivative chains consumed by `tick`.
pub struct Simulation {
    params: SphereParams,
    graph: Graph,
    x: Var3Id,
    v: Var3Id,
    table_spin: Var3Id,
    table_angle: Var3Id,
    ball_spin: Var3Id,
    ball_angle: Var3Id,
    v_derivs: [Expr3Id; 3],
    ball_spin_derivs: [Expr3Id; 3],
    table_spin_derivs: [Expr3Id; 3],
    blow_up_logged: bool,
}

impl Simulation {
    pub fn new(params: SphereParams, initial: InitialState) -> Result<Self, ParamError> {
        params.validate()?;
        let mut graph = Graph::new();

        // Phase 1: leaves and the slip-friction expression. The slip is the
        // table surface speed under the contact point minus the speed of the
        // ball material at that point.
        let x = graph.var3(initial.position);
        let v = graph.var3(initial.velocity);
        let table_spin = graph.var3(initial.table_spin);
        let table_angle = graph.var3(Vector3::zeros());
        let ball_spin = graph.var3(initial.ball_spin);
        let ball_angle = graph.var3(Vector3::zeros());

        let contact = graph.constant3(Vector3::new(0.0, 0.0, -params.radius));
        let surface_vel = graph.cross(table_spin, x);
        let spin_vel = graph.cross(ball_spin, contact);
        let contact_vel = graph.add3(v, spin_vel);
        let slip = graph.sub3(surface_vel, contact_vel);
        let gain = graph.constant(params.slip_gain);
        let friction = graph.scale(slip, gain);

        // Phase 2: derivative wiring. Order matters: every expression the
        // tables capture must already exist.
        graph.set_dt3(x, v.into(), 0);

        let inv_mass = graph.constant(1.0 / params.mass);
        let accel = graph.scale(friction, inv_mass);
        graph.set_dt3(v, accel, 0);

        let ball_torque = graph.cross(contact, friction);
        let inv_inertia = graph.constant(1.0 / params.ball_inertia());
        let ball_spin_rate = graph.scale(ball_torque, inv_inertia);
        graph.set_dt3(ball_spin, ball_spin_rate, 0);

        let table_torque = graph.cross(x, friction);
        let inv_table = graph.constant(-1.0 / params.table_inertia);
        let table_spin_rate = graph.scale(table_torque, inv_table);
        graph.set_dt3(table_spin, table_spin_rate, 0);

        graph.set_dt3(ball_angle, ball_spin.into(), 0);
        graph.set_dt3(table_angle, table_spin.into(), 0);

        // Derivative chains up to third order. Each order differentiates the
        // previous order's handle; differentiating the base again would
        // duplicate whole subgraphs.
        let v_derivs = derive_chain(&mut graph, v);
        let ball_spin_derivs = derive_chain(&mut graph, ball_spin);
        let table_spin_derivs = derive_chain(&mut graph, table_spin);

        Ok(Self {
            params,
            graph,
            x,
            v,
            table_spin,
            table_angle,
            ball_spin,
            ball_angle,
            v_derivs,
            ball_spin_derivs,
            table_spin_derivs,
            blow_up_logged: false,
        })
    }

    /// Advance the model by `dt` time units. Requests above
    /// `params.max_step` are clamped; `dt <= 0` (or a non-finite request
    /// collapsing to it) is a no-op. Never fails: non-finite state
    /// propagates through IEEE arithmetic and is only reported, not caught.
    pub fn tick(&mut self, dt: f64) {
        if dt.is_nan() {
            return;
        }
        let dt = dt.min(self.params.max_step);
        let steps = (dt * self.params.substep_rate).ceil();
        if steps < 1.0 {
            return;
        }
        let n = steps as usize;
        let h = dt / n as f64;
        for _ in 0..n {
            self.substep(h);
        }
        self.check_finite();
    }

    /// One Taylor sub-step. The nine derivative expressions are evaluated at
    /// the current state before any leaf is written; every write then goes
    /// through the mutator so the next sub-step sees fresh evaluations.
    fn substep(&mut self, dt: f64) {
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;

        let [v1, v2, v3] = self.v_derivs;
        let dv = self.graph.eval3(v1) * dt;
        let d2v = self.graph.eval3(v2) * dt2;
        let d3v = self.graph.eval3(v3) * dt3;

        let [b1, b2, b3] = self.ball_spin_derivs;
        let dw = self.graph.eval3(b1) * dt;
        let d2w = self.graph.eval3(b2) * dt2;
        let d3w = self.graph.eval3(b3) * dt3;

        let [t1, t2, t3] = self.table_spin_derivs;
        let dq = self.graph.eval3(t1) * dt;
        let d2q = self.graph.eval3(t2) * dt2;
        let d3q = self.graph.eval3(t3) * dt3;

        // accumulators integrate rate + d/2 + d2/6 + d3/24 over the step;
        // the rates themselves pick up d + d2/2 + d3/6
        let x_new = self.graph.value3(self.x)
            + (self.graph.value3(self.v) + dv / 2.0 + d2v / 6.0 + d3v / 24.0) * dt;
        let ball_angle_new = self.graph.value3(self.ball_angle)
            + (self.graph.value3(self.ball_spin) + dw / 2.0 + d2w / 6.0 + d3w / 24.0) * dt;
        let table_angle_new = self.graph.value3(self.table_angle)
            + (self.graph.value3(self.table_spin) + dq / 2.0 + d2q / 6.0 + d3q / 24.0) * dt;
        let v_new = self.graph.value3(self.v) + dv + d2v / 2.0 + d3v / 6.0;
        let ball_spin_new = self.graph.value3(self.ball_spin) + dw + d2w / 2.0 + d3w / 6.0;
        let table_spin_new = self.graph.value3(self.table_spin) + dq + d2q / 2.0 + d3q / 6.0;

        self.graph.set3(self.x, x_new);
        self.graph.set3(self.ball_angle, ball_angle_new);
        self.graph.set3(self.table_angle, table_angle_new);
        self.graph.set3(self.v, v_new);
        self.graph.set3(self.ball_spin, ball_spin_new);
        self.graph.set3(self.table_spin, table_spin_new);
    }

    fn check_finite(&mut self) {
        if self.blow_up_logged {
            return;
        }
        let finite = |v: Vector3<f64>| v.iter().all(|c| c.is_finite());
        let pos = self.graph.value3(self.x);
        let vel = self.graph.value3(self.v);
        if !finite(pos)
            || !finite(vel)
            || !finite(self.graph.value3(self.ball_spin))
            || !finite(self.graph.value3(self.table_spin))
        {
            log::warn!("state went non-finite: x = {pos:?}, v = {vel:?}");
            self.blow_up_logged = true;
        }
    }

    pub fn params(&self) -> &SphereParams {
        &self.params
    }

    /// The expression graph backing the model, for inspection (node count,
    /// recompute counter).
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Contact-frame position of the ball.
    pub fn position(&self) -> Vector3<f64> {
        self.graph.value3(self.x)
    }

    /// Ball center: the contact position lifted by one radius.
    pub fn center_position(&self) -> Vector3<f64> {
        self.position() + Vector3::new(0.0, 0.0, self.params.radius)
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.graph.value3(self.v)
    }

    pub fn ball_spin(&self) -> Vector3<f64> {
        self.graph.value3(self.ball_spin)
    }

    pub fn table_spin(&self) -> Vector3<f64> {
        self.graph.value3(self.table_spin)
    }

    /// Axis-angle orientation of the ball, derived from its accumulated
    /// rotation vector: unit axis and magnitude angle. Identity rotation
    /// reports the z axis with a zero angle.
    pub fn orientation(&self) -> (Vector3<f64>, f64) {
        let rotation = self.graph.value3(self.ball_angle);
        let angle = rotation.norm();
        if angle == 0.0 {
            (Vector3::z(), 0.0)
        } else {
            (rotation / angle, angle)
        }
    }

    /// Planar heading of the turntable: third component of its accumulated
    /// rotation.
    pub fn heading(&self) -> f64 {
        self.graph.value3(self.table_angle).z
    }
}

fn derive_chain(graph: &mut Graph, var: Var3Id) -> [Expr3Id; 3] {
    let d1 = graph.dt3(var, 0);
    let d2 = graph.dt3(d1, 0);
    let d3 = graph.dt3(d2, 0);
    [d1, d2, d3]
}
