//! Oracle that answers immediately without acting.
//!
//! Used to check the pipeline end to end: provisioning, patch capture,
//! persistence and summaries all run, the agent never does anything.

use async_trait::async_trait;

use super::{Conversation, DecisionOracle, OracleError, OracleTurn};

pub(crate) struct NoopOracle;

#[async_trait]
impl DecisionOracle for NoopOracle {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn next_action(&self, _conversation: &Conversation) -> Result<OracleTurn, OracleError> {
        Ok(OracleTurn::answer("No action taken."))
    }
}
