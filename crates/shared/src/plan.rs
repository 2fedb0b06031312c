//! Subscription plans

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of plans a subscriber can be entitled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Premium => "premium",
        }
    }

    /// Paid plans are the only ones a checkout session can sell.
    pub fn is_paid(&self) -> bool {
        !matches!(self, Plan::Free)
    }

    pub fn paid_plans() -> [Plan; 2] {
        [Plan::Pro, Plan::Premium]
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan: {0}")]
pub struct PlanParseError(pub String);

impl FromStr for Plan {
    type Err = PlanParseError;

    /// Accepts both the stored lowercase form and the display form
    /// ("Pro", "Premium") the checkout metadata carries.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            "premium" => Ok(Plan::Premium),
            _ => Err(PlanParseError(s.to_string())),
        }
    }
}
