//! Symbolic differentiation over the expression arena.
//!
//! `dt`/`dt3` build a *new* expression for the derivative of a node along a
//! channel by composing the children's derivatives per the calculus rule of
//! each operator. Every call on a composed node allocates fresh nodes, so a
//! caller that wants higher orders must chain from the previous order's
//! handle rather than differentiating the same base twice. Variables are the
//! only ground truth: their channel table is installed once at construction
//! time, and an unset channel degenerates to a zero constant. Operands whose
//! derivative is known to be zero (constants) are folded away where the rule
//! allows it, which keeps the third-order trees the integrator evaluates
//! materially smaller.

use nalgebra::Vector3;

use crate::graph::{Expr3Id, ExprId, Graph, Op};

impl Graph {
    /// Derivative of a scalar expression along `channel`, as a new
    /// expression.
    pub fn dt(&mut self, id: impl Into<ExprId>, channel: usize) -> ExprId {
        let id = id.into();
        match self.nodes[id.0].op {
            Op::Const(_) => self.constant(0.0),
            Op::Var { .. } => match self.scalar_table_entry(id.0, channel) {
                Some(installed) => installed,
                None => self.constant(0.0),
            },
            Op::Neg(a) => {
                let da = self.dt(a, channel);
                self.neg(da)
            }
            Op::Add(a, b) => {
                if self.is_const(a) {
                    return self.dt(b, channel);
                }
                if self.is_const(b) {
                    return self.dt(a, channel);
                }
                let da = self.dt(a, channel);
                let db = self.dt(b, channel);
                self.add(da, db)
            }
            Op::Sub(a, b) => {
                if self.is_const(a) {
                    let db = self.dt(b, channel);
                    return self.neg(db);
                }
                if self.is_const(b) {
                    return self.dt(a, channel);
                }
                let da = self.dt(a, channel);
                let db = self.dt(b, channel);
                self.sub(da, db)
            }
            Op::Mul(a, b) => {
                // constant operands survive as coefficients; their own
                // derivative term is zero and is dropped
                if self.is_const(a) {
                    let db = self.dt(b, channel);
                    return self.mul(db, a);
                }
                if self.is_const(b) {
                    let da = self.dt(a, channel);
                    return self.mul(da, b);
                }
                let da = self.dt(a, channel);
                let db = self.dt(b, channel);
                let left = self.mul(da, b);
                let right = self.mul(a, db);
                self.add(left, right)
            }
            Op::Div(a, b) => {
                // d(a/b) = da/b - a*db*b^-2
                let da = self.dt(a, channel);
                let db = self.dt(b, channel);
                let first = self.div(da, b);
                let numerator = self.mul(a, db);
                let inv_sq = self.pow(b, -2.0);
                let second = self.mul(numerator, inv_sq);
                self.sub(first, second)
            }
            Op::Pow(a, n) => {
                // d(a^n) = n * a^(n-1) * da, n a literal
                let da = self.dt(a, channel);
                let coeff = self.constant(n);
                let reduced = self.pow(a, n - 1.0);
                let outer = self.mul(coeff, reduced);
                self.mul(outer, da)
            }
            Op::Sin { expr, amplitude } => {
                let de = self.dt(expr, channel);
                let outer = self.cos(expr, 1.0);
                let chained = self.mul(outer, de);
                let am = self.constant(amplitude);
                self.mul(am, chained)
            }
            Op::Cos { expr, amplitude } => {
                let de = self.dt(expr, channel);
                let outer = self.sin(expr, 1.0);
                let negated = self.neg(outer);
                let chained = self.mul(negated, de);
                let am = self.constant(amplitude);
                self.mul(am, chained)
            }
            Op::Dot(a, b) => {
                if self.is_const3(a) {
                    let db = self.dt3(b, channel);
                    return self.dot(a, db);
                }
                if self.is_const3(b) {
                    let da = self.dt3(a, channel);
                    return self.dot(da, b);
                }
                let da = self.dt3(a, channel);
                let db = self.dt3(b, channel);
                let left = self.dot(da, b);
                let right = self.dot(a, db);
                self.add(left, right)
            }
            _ => unreachable!("vector-valued op behind a scalar handle"),
        }
    }

    /// Derivative of a vector expression along `channel`, as a new
    /// expression.
    pub fn dt3(&mut self, id: impl Into<Expr3Id>, channel: usize) -> Expr3Id {
        let id = id.into();
        match self.nodes[id.0].op {
            Op::Const3(_) => self.constant3(Vector3::zeros()),
            Op::Var3 { .. } => match self.vector_table_entry(id.0, channel) {
                Some(installed) => installed,
                None => self.constant3(Vector3::zeros()),
            },
            Op::Neg3(a) => {
                let da = self.dt3(a, channel);
                self.neg3(da)
            }
            Op::Add3(a, b) => {
                if self.is_const3(a) {
                    return self.dt3(b, channel);
                }
                if self.is_const3(b) {
                    return self.dt3(a, channel);
                }
                let da = self.dt3(a, channel);
                let db = self.dt3(b, channel);
                self.add3(da, db)
            }
            Op::Sub3(a, b) => {
                if self.is_const3(a) {
                    let db = self.dt3(b, channel);
                    return self.neg3(db);
                }
                if self.is_const3(b) {
                    return self.dt3(a, channel);
                }
                let da = self.dt3(a, channel);
                let db = self.dt3(b, channel);
                self.sub3(da, db)
            }
            Op::Scale(v, s) => {
                // mixed-type product rule: d(v*s) = dv*s + v*ds
                if self.is_const3(v) {
                    let ds = self.dt(s, channel);
                    return self.scale(v, ds);
                }
                if self.is_const(s) {
                    let dv = self.dt3(v, channel);
                    return self.scale(dv, s);
                }
                let dv = self.dt3(v, channel);
                let ds = self.dt(s, channel);
                let left = self.scale(dv, s);
                let right = self.scale(v, ds);
                self.add3(left, right)
            }
            Op::Cross(a, b) => {
                // product rule keeps operand order: cross does not commute
                if self.is_const3(a) {
                    let db = self.dt3(b, channel);
                    return self.cross(a, db);
                }
                if self.is_const3(b) {
                    let da = self.dt3(a, channel);
                    return self.cross(da, b);
                }
                let da = self.dt3(a, channel);
                let db = self.dt3(b, channel);
                let left = self.cross(da, b);
                let right = self.cross(a, db);
                self.add3(left, right)
            }
            _ => unreachable!("scalar-valued op behind a vector handle"),
        }
    }

    fn scalar_table_entry(&self, idx: usize, channel: usize) -> Option<ExprId> {
        match &self.nodes[idx].op {
            Op::Var { dt, .. } => dt.get(channel).copied().flatten(),
            _ => None,
        }
    }

    fn vector_table_entry(&self, idx: usize, channel: usize) -> Option<Expr3Id> {
        match &self.nodes[idx].op {
            Op::Var3 { dt, .. } => dt.get(channel).copied().flatten(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Two scalar variables with independently wired derivative variables,
    /// the fixture most of the law checks share.
    fn scalar_pair(g: &mut Graph) -> (crate::graph::VarId, crate::graph::VarId, f64, f64, f64, f64) {
        let (a_val, b_val, da_val, db_val) = (1.7, -0.6, 0.31, 2.4);
        let a = g.var(a_val);
        let b = g.var(b_val);
        let da = g.var(da_val);
        let db = g.var(db_val);
        g.set_dt(a, da.into(), 0);
        g.set_dt(b, db.into(), 0);
        (a, b, a_val, b_val, da_val, db_val)
    }

    #[test]
    fn constant_derivative_is_zero_at_any_order() {
        let mut g = Graph::new();
        let c = g.constant(42.0);
        let d1 = g.dt(c, 0);
        let d2 = g.dt(d1, 0);
        let d3 = g.dt(d2, 0);
        assert_eq!(g.eval(d1), 0.0);
        assert_eq!(g.eval(d2), 0.0);
        assert_eq!(g.eval(d3), 0.0);

        let c3 = g.constant3(Vector3::new(1.0, 2.0, 3.0));
        let d1 = g.dt3(c3, 0);
        let d2 = g.dt3(d1, 0);
        assert_eq!(g.eval3(d1), Vector3::zeros());
        assert_eq!(g.eval3(d2), Vector3::zeros());
    }

    #[test]
    fn unwired_variable_degenerates_to_zero() {
        let mut g = Graph::new();
        let x = g.var(5.0);
        let d = g.dt(x, 0);
        assert_eq!(g.eval(d), 0.0);
        // a different channel of a wired variable is just as unset
        let dx = g.var(1.0);
        g.set_dt(x, dx.into(), 0);
        let d_other = g.dt(x, 3);
        assert_eq!(g.eval(d_other), 0.0);
    }

    #[test]
    fn variable_returns_its_installed_entry() {
        let mut g = Graph::new();
        let x = g.var(2.0);
        let dx = g.var(7.0);
        g.set_dt(x, dx.into(), 0);
        // the table entry itself, shared, not a copy
        assert_eq!(g.dt(x, 0), ExprId::from(dx));
        assert_eq!(g.dt(x, 0), ExprId::from(dx));
    }

    #[test]
    fn product_rule() {
        let mut g = Graph::new();
        let (a, b, a_val, b_val, da_val, db_val) = scalar_pair(&mut g);
        let f = g.mul(a, b);
        let df = g.dt(f, 0);
        assert_relative_eq!(g.eval(df), da_val * b_val + a_val * db_val, epsilon = 1e-12);
    }

    #[test]
    fn sum_and_difference_rules() {
        let mut g = Graph::new();
        let (a, b, _, _, da_val, db_val) = scalar_pair(&mut g);
        let sum = g.add(a, b);
        let d_sum = g.dt(sum, 0);
        assert_relative_eq!(g.eval(d_sum), da_val + db_val, epsilon = 1e-12);

        let diff = g.sub(a, b);
        let d_diff = g.dt(diff, 0);
        assert_relative_eq!(g.eval(d_diff), da_val - db_val, epsilon = 1e-12);
    }

    #[test]
    fn quotient_rule() {
        let mut g = Graph::new();
        let (a, b, a_val, b_val, da_val, db_val) = scalar_pair(&mut g);
        let f = g.div(a, b);
        let df = g.dt(f, 0);
        let expected = da_val / b_val - a_val * db_val / (b_val * b_val);
        assert_relative_eq!(g.eval(df), expected, epsilon = 1e-12);
    }

    #[test]
    fn power_rule() {
        let mut g = Graph::new();
        let (a, _, a_val, _, da_val, _) = scalar_pair(&mut g);
        let f = g.pow(a, 3.0);
        let df = g.dt(f, 0);
        assert_relative_eq!(g.eval(df), 3.0 * a_val * a_val * da_val, epsilon = 1e-12);
    }

    #[test]
    fn trig_chain_rules_carry_the_amplitude() {
        let mut g = Graph::new();
        let (a, _, a_val, _, da_val, _) = scalar_pair(&mut g);

        let s = g.sin(a, 2.5);
        let ds = g.dt(s, 0);
        assert_relative_eq!(g.eval(ds), 2.5 * a_val.cos() * da_val, epsilon = 1e-12);

        let c = g.cos(a, 2.5);
        let dc = g.dt(c, 0);
        assert_relative_eq!(g.eval(dc), -2.5 * a_val.sin() * da_val, epsilon = 1e-12);
    }

    #[test]
    fn negation_rule() {
        let mut g = Graph::new();
        let (a, _, _, _, da_val, _) = scalar_pair(&mut g);
        let f = g.neg(a);
        let df = g.dt(f, 0);
        assert_relative_eq!(g.eval(df), -da_val, epsilon = 1e-12);
    }

    #[test]
    fn constant_addend_is_skipped_structurally() {
        let mut g = Graph::new();
        let x = g.var(3.0);
        let dx = g.var(1.25);
        g.set_dt(x, dx.into(), 0);
        let c = g.constant(10.0);

        // the derivative of x + c IS the installed dx handle, no Add built
        let f = g.add(x, c);
        assert_eq!(g.dt(f, 0), ExprId::from(dx));

        // c - x negates, x - c passes through
        let f = g.sub(x, c);
        assert_eq!(g.dt(f, 0), ExprId::from(dx));
        let f = g.sub(c, x);
        let df = g.dt(f, 0);
        assert_relative_eq!(g.eval(df), -1.25, epsilon = 1e-12);
    }

    #[test]
    fn constant_factor_survives_as_coefficient() {
        let mut g = Graph::new();
        let x = g.var(3.0);
        let dx = g.var(1.25);
        g.set_dt(x, dx.into(), 0);
        let c = g.constant(4.0);

        let f = g.mul(c, x);
        let df = g.dt(f, 0);
        assert_relative_eq!(g.eval(df), 4.0 * 1.25, epsilon = 1e-12);

        let f = g.mul(x, c);
        let df = g.dt(f, 0);
        assert_relative_eq!(g.eval(df), 1.25 * 4.0, epsilon = 1e-12);
    }

    #[test]
    fn dot_product_rule() {
        let mut g = Graph::new();
        let p_val = Vector3::new(1.0, 2.0, -0.5);
        let q_val = Vector3::new(0.3, -1.0, 2.0);
        let dp_val = Vector3::new(0.1, 0.0, 1.0);
        let dq_val = Vector3::new(-2.0, 0.5, 0.25);
        let p = g.var3(p_val);
        let q = g.var3(q_val);
        let dp = g.var3(dp_val);
        let dq = g.var3(dq_val);
        g.set_dt3(p, dp.into(), 0);
        g.set_dt3(q, dq.into(), 0);

        let f = g.dot(p, q);
        let df = g.dt(f, 0);
        let expected = dp_val.dot(&q_val) + p_val.dot(&dq_val);
        assert_relative_eq!(g.eval(df), expected, epsilon = 1e-12);
    }

    #[test]
    fn dot_constant_shortcut_is_symmetric() {
        let mut g = Graph::new();
        let p_val = Vector3::new(1.0, 2.0, -0.5);
        let dp_val = Vector3::new(0.1, 0.0, 1.0);
        let p = g.var3(p_val);
        let dp = g.var3(dp_val);
        g.set_dt3(p, dp.into(), 0);
        let k = Vector3::new(0.0, 3.0, 1.0);

        let c = g.constant3(k);
        let f = g.dot(c, p);
        let df = g.dt(f, 0);
        assert_relative_eq!(g.eval(df), k.dot(&dp_val), epsilon = 1e-12);

        let f = g.dot(p, c);
        let df = g.dt(f, 0);
        assert_relative_eq!(g.eval(df), dp_val.dot(&k), epsilon = 1e-12);
    }

    #[test]
    fn cross_product_rule_keeps_operand_order() {
        let mut g = Graph::new();
        let p_val = Vector3::new(1.0, 2.0, -0.5);
        let q_val = Vector3::new(0.3, -1.0, 2.0);
        let dp_val = Vector3::new(0.1, 0.0, 1.0);
        let dq_val = Vector3::new(-2.0, 0.5, 0.25);
        let p = g.var3(p_val);
        let q = g.var3(q_val);
        let dp = g.var3(dp_val);
        let dq = g.var3(dq_val);
        g.set_dt3(p, dp.into(), 0);
        g.set_dt3(q, dq.into(), 0);

        let f = g.cross(p, q);
        let df = g.dt3(f, 0);
        let expected = dp_val.cross(&q_val) + p_val.cross(&dq_val);
        assert_relative_eq!(g.eval3(df), expected, epsilon = 1e-12);

        // constant shortcuts on either side
        let k = Vector3::new(0.0, 0.0, 2.0);
        let c = g.constant3(k);
        let f = g.cross(c, p);
        let df = g.dt3(f, 0);
        assert_relative_eq!(g.eval3(df), k.cross(&dp_val), epsilon = 1e-12);
        let f = g.cross(p, c);
        let df = g.dt3(f, 0);
        assert_relative_eq!(g.eval3(df), dp_val.cross(&k), epsilon = 1e-12);
    }

    #[test]
    fn scale_follows_the_mixed_product_rule() {
        let mut g = Graph::new();
        let v_val = Vector3::new(1.0, -2.0, 0.5);
        let dv_val = Vector3::new(0.2, 0.1, -1.0);
        let v = g.var3(v_val);
        let dv = g.var3(dv_val);
        g.set_dt3(v, dv.into(), 0);
        let s = g.var(3.0);
        let ds = g.var(-0.5);
        g.set_dt(s, ds.into(), 0);

        let f = g.scale(v, s);
        let df = g.dt3(f, 0);
        let expected = dv_val * 3.0 + v_val * -0.5;
        assert_relative_eq!(g.eval3(df), expected, epsilon = 1e-12);

        // scalar-constant shortcut: d(v*k) = dv*k
        let k = g.constant(4.0);
        let f = g.scale(v, k);
        let df = g.dt3(f, 0);
        assert_relative_eq!(g.eval3(df), dv_val * 4.0, epsilon = 1e-12);
    }

    #[test]
    fn vector_sum_difference_and_negation_rules() {
        let mut g = Graph::new();
        let dp_val = Vector3::new(0.1, 0.0, 1.0);
        let dq_val = Vector3::new(-2.0, 0.5, 0.25);
        let p = g.var3(Vector3::new(1.0, 1.0, 1.0));
        let q = g.var3(Vector3::new(2.0, 0.0, -1.0));
        let dp = g.var3(dp_val);
        let dq = g.var3(dq_val);
        g.set_dt3(p, dp.into(), 0);
        g.set_dt3(q, dq.into(), 0);

        let sum = g.add3(p, q);
        let d_sum = g.dt3(sum, 0);
        assert_relative_eq!(g.eval3(d_sum), dp_val + dq_val, epsilon = 1e-12);

        let diff = g.sub3(p, q);
        let d_diff = g.dt3(diff, 0);
        assert_relative_eq!(g.eval3(d_diff), dp_val - dq_val, epsilon = 1e-12);

        let neg = g.neg3(p);
        let d_neg = g.dt3(neg, 0);
        assert_relative_eq!(g.eval3(d_neg), -dp_val, epsilon = 1e-12);

        // constant operand folds away: d(p + k) = dp
        let k = g.constant3(Vector3::new(9.0, 9.0, 9.0));
        let shifted = g.add3(p, k);
        assert_eq!(g.dt3(shifted, 0), Expr3Id::from(dp));
    }

    #[test]
    fn repeated_dt_builds_equal_but_distinct_trees() {
        let mut g = Graph::new();
        let (a, b, a_val, b_val, da_val, db_val) = scalar_pair(&mut g);
        let f = g.mul(a, b);
        let first = g.dt(f, 0);
        let second = g.dt(f, 0);
        assert_ne!(first, second);
        let expected = da_val * b_val + a_val * db_val;
        assert_relative_eq!(g.eval(first), expected, epsilon = 1e-12);
        assert_relative_eq!(g.eval(second), expected, epsilon = 1e-12);
    }

    #[test]
    fn chained_orders_follow_leaf_updates() {
        // x with dx/dt = 1: f = x^2, so f' = 2x and f'' = 2
        let mut g = Graph::new();
        let x = g.var(3.0);
        let one = g.var(1.0);
        g.set_dt(x, one.into(), 0);
        let f = g.mul(x, x);
        let d1 = g.dt(f, 0);
        let d2 = g.dt(d1, 0);
        assert_relative_eq!(g.eval(d1), 6.0, epsilon = 1e-12);
        assert_relative_eq!(g.eval(d2), 2.0, epsilon = 1e-12);

        g.set(x, -4.0);
        assert_relative_eq!(g.eval(d1), -8.0, epsilon = 1e-12);
        assert_relative_eq!(g.eval(d2), 2.0, epsilon = 1e-12);
    }
}
