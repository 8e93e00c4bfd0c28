//! /usage command - show estimated token usage

use super::CommandResult;
use crate::utils::format_number;
use parley_engine::StreamingCoordinator;

/// Price per million tokens used for the rough cost estimate
const PRICE_PER_MILLION: f64 = 3.0;

pub struct UsageCommand;

impl UsageCommand {
    pub fn execute(coordinator: &StreamingCoordinator) -> CommandResult {
        let usage = coordinator.store().usage();

        let mut output = String::from("Usage (estimated)\n");
        output.push_str(&"-".repeat(40));
        output.push('\n');

        output.push_str(&format!(
            "  {:<8} {:>10} {:>10}\n",
            "", "Tokens", "Requests"
        ));
        for (label, tokens, requests) in [
            ("Today", usage.tokens_today, usage.requests_today),
            ("Week", usage.tokens_week, usage.requests_week),
            ("Month", usage.tokens_month, usage.requests_month),
        ] {
            output.push_str(&format!(
                "  {:<8} {:>10} {:>10}\n",
                label,
                format_number(tokens),
                requests
            ));
        }
        output.push('\n');

        output.push_str(&format!(
            "Estimated cost this month: ${:.4}",
            usage.estimated_cost(PRICE_PER_MILLION)
        ));

        CommandResult::Message(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::coordinator;

    #[test]
    fn test_usage_reports_counters() {
        let c = coordinator();
        c.store().record_usage(4000);
        let CommandResult::Message(text) = UsageCommand::execute(&c) else {
            panic!("expected a message");
        };
        assert!(text.contains("Today"));
        assert!(text.contains("1.0k"));
        assert!(text.contains("$0.0030"));
    }
}
