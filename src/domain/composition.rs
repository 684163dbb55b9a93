//! Wine lot composition: the fractional breakdown of a lot by
//! (variety, appellation, vintage).

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single grape component identity. Hashable so it can key a
/// composition map directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LotComponent {
    pub variety: String,
    pub appellation: String,
    pub vintage: i32,
}

impl LotComponent {
    pub fn new(variety: impl Into<String>, appellation: impl Into<String>, vintage: i32) -> Self {
        Self {
            variety: variety.into(),
            appellation: appellation.into(),
            vintage,
        }
    }
}

/// A (component, percent) pair as stored in a `WineLotCreated` event
/// payload, where a `HashMap` key would serialize awkwardly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentAmount {
    pub component: LotComponent,
    pub percent: Decimal,
}

/// A lot's fractional makeup. The sum of `percent` values must land in
/// `[0.9999, 1.0001]` whenever the lot holds positive volume; composition
/// is never persisted, only derived by replaying events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Composition(pub HashMap<LotComponent, Decimal>);

impl Composition {
    pub fn from_components(components: &[ComponentAmount]) -> Self {
        Composition(
            components
                .iter()
                .map(|c| (c.component.clone(), c.percent))
                .collect(),
        )
    }

    pub fn sum(&self) -> Decimal {
        self.0.values().copied().sum()
    }

    pub fn is_conserved(&self) -> bool {
        let total = self.sum();
        total >= Decimal::new(9999, 4) && total <= Decimal::new(10001, 4)
    }

    /// Scales every fraction by `factor`, used when folding existing
    /// composition into a post-blend composition.
    pub fn scaled(&self, factor: Decimal) -> Composition {
        Composition(self.0.iter().map(|(k, v)| (k.clone(), *v * factor)).collect())
    }

    /// Adds another composition's weighted fractions into this one.
    pub fn merge_add(&mut self, other: &Composition) {
        for (component, fraction) in &other.0 {
            *self.0.entry(component.clone()).or_insert(Decimal::ZERO) += *fraction;
        }
    }
}
