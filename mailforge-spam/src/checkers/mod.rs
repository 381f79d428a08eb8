//! The built-in checkers.

mod bayes;
mod content;
mod dkim;
mod dmarc;
mod greylist;
mod rbl;
mod spf;

pub use bayes::BayesChecker;
pub use content::{ContentChecker, ContentRule, RulePart};
pub use dkim::{DkimChecker, DkimScores};
pub use dmarc::{DmarcChecker, DmarcScores};
pub use greylist::{GreylistChecker, GreylistConfig};
pub use rbl::{Dnsbl, RblChecker};
pub use spf::{SpfChecker, SpfScores};
