//! Interactive confirmation prompts.

use anyhow::Result;
use dialoguer::{Confirm, Input};

use ktl_core::apply::Confirmer;
use ktl_types::PlanResult;

/// Terminal prompts backing the engine's confirmation gates.
pub struct PromptConfirmer;

impl Confirmer for PromptConfirmer {
    fn confirm_apply(&self, plan: &PlanResult) -> Result<bool> {
        let prompt = format!(
            "Apply {} create(s), {} update(s), {} delete(s) to release {} in {}?",
            plan.summary.creates,
            plan.summary.updates,
            plan.summary.deletes,
            plan.release,
            plan.namespace,
        );
        Ok(Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?)
    }

    fn confirm_destroy(&self, release: &str) -> Result<String> {
        Ok(Input::<String>::new()
            .with_prompt(format!(
                "Type the release name ({release}) to confirm destruction"
            ))
            .allow_empty(true)
            .interact_text()?)
    }
}
