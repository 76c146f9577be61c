//! Markdown and JSON rendering of a finished analysis

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dataset::BinaryLevels;
use crate::estimate::{CausalEstimate, EstimationMethod};
use crate::identify::IdentifiedEstimand;
use crate::refute::RefutationResult;
use crate::CausalError;

/// Outcome of one complete run: three estimates and three refutations.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub treatment: String,
    pub outcome: String,
    /// Raw treatment values read as `false` and `true`
    pub treatment_levels: BinaryLevels,
    pub method: EstimationMethod,
    pub estimand: IdentifiedEstimand,
    pub ate: CausalEstimate,
    pub atc: CausalEstimate,
    pub att: CausalEstimate,
    pub random_common_cause: RefutationResult,
    pub data_subset: RefutationResult,
    pub placebo: RefutationResult,
    pub elapsed_secs: f64,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisReport {
    pub fn to_markdown(&self) -> String {
        let t = &self.treatment;
        let y = &self.outcome;
        let ate = format_sig3(self.ate.value);
        let atc = format_sig3(self.atc.value);
        let att = format_sig3(self.att.value);
        let untreated = self.treatment_levels.false_value.as_deref().unwrap_or("0");
        let treated = self.treatment_levels.true_value.as_deref().unwrap_or("1");

        let mut out = String::new();
        // writing into a String cannot fail
        let _ = writeln!(out, "**Effects**:\n");
        let _ = writeln!(out, "| ATE | ATC | ATT |");
        let _ = writeln!(out, "| --- | --- | --- |");
        let _ = writeln!(out, "| {ate} | {atc} | {att} |\n");

        let _ = writeln!(out, "**Explanations**:  ");
        let explain = [
            ("ATE", &ate, "over the population represented in the dataset"),
            ("ATC", &atc, "over the `control group`"),
            ("ATT", &att, "over the `treated group`"),
        ];
        for (label, value, population) in explain {
            let _ = writeln!(
                out,
                "**{label}** - Raising the treatment variable `{t}` from {untreated} to {treated}  \n\
                 causes an increase of **{value}** in the expected value of the outcome  \n\
                 `{y}`, {population}.\n"
            );
        }

        if !self.estimand.identified {
            let _ = writeln!(
                out,
                "**Warning**: the effect is not fully identified; backdoor paths through \
                 unobserved variables ({}) may remain open.\n",
                self.estimand.unobserved_confounders.join(", ")
            );
        }

        let _ = writeln!(out, "**Refuters**:  ");
        let _ = writeln!(
            out,
            "Random and Subset - If the assumptions are correct the new value should not change much.  "
        );
        let _ = writeln!(
            out,
            "Placebo - If the assumptions are correct the new value should be close to zero.  \n"
        );
        let _ = writeln!(
            out,
            "| Estimated effect | Random effect | Subset effect | Placebo effect |"
        );
        let _ = writeln!(out, "| --- | --- | --- | --- |");
        let _ = writeln!(
            out,
            "| {ate} | {} | {} | {} |\n",
            format_sig3(self.random_common_cause.new_effect),
            format_sig3(self.data_subset.new_effect),
            format_sig3(self.placebo.new_effect)
        );

        let _ = write!(out, "Run time: {:.3} minutes", self.elapsed_secs / 60.0);
        out
    }

    pub fn to_json(&self) -> Result<String, CausalError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Format like C's `%.3g`: three significant digits, fixed notation for
/// decimal exponents in `[-4, 3)`, scientific otherwise, trailing zeros
/// removed.
pub fn format_sig3(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // the exponent after rounding to three digits decides the notation
    let scientific = format!("{value:.2e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return scientific;
    };

    if !(-4..3).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exponent.abs())
    } else {
        let decimals = (2 - exponent) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::TargetUnits;
    use crate::identify::EstimandType;
    use crate::refute::RefuterKind;
    use proptest::prelude::*;

    #[test]
    fn test_format_sig3_matches_printf() {
        let cases = [
            (0.00123456, "0.00123"),
            (1234.5678, "1.23e+03"),
            (2.0, "2"),
            (-2.0134, "-2.01"),
            (0.1, "0.1"),
            (999.5, "1e+03"),
            (99.95, "100"),
            (123.4, "123"),
            (0.0001, "0.0001"),
            (0.000012345, "1.23e-05"),
            (-1.5e10, "-1.5e+10"),
            (1e100, "1e+100"),
            (0.0, "0"),
        ];
        for (value, expected) in cases {
            assert_eq!(format_sig3(value), expected, "formatting {value}");
        }
        assert_eq!(format_sig3(f64::NAN), "nan");
        assert_eq!(format_sig3(f64::INFINITY), "inf");
        assert_eq!(format_sig3(f64::NEG_INFINITY), "-inf");
    }

    proptest! {
        #[test]
        fn test_format_sig3_keeps_three_digits(value in -1e12f64..1e12f64) {
            let text = format_sig3(value);
            let mantissa = text.split('e').next().unwrap_or("");
            let digits: String = mantissa
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect::<String>()
                .trim_start_matches('0')
                .to_string();
            prop_assert!(digits.len() <= 3, "{value} -> {text}");
            let parsed: f64 = text.parse().unwrap();
            if value != 0.0 {
                prop_assert!(((parsed - value) / value).abs() <= 0.005 + 1e-12, "{value} -> {text}");
            }
        }
    }

    fn estimate(value: f64, target: TargetUnits) -> CausalEstimate {
        CausalEstimate {
            value,
            method: EstimationMethod::PropensityScoreStratification,
            target_units: target,
            backdoor_variables: vec!["Z1".into(), "Z2".into()],
            strata_used: Some(18),
            strata_dropped: Some(2),
            n_units: 100,
        }
    }

    fn refutation(refuter: RefuterKind, new_effect: f64) -> RefutationResult {
        RefutationResult {
            refuter,
            estimated_effect: 2.0134,
            new_effect,
            simulations: 100,
            p_value: Some(0.5),
        }
    }

    fn report(identified: bool) -> AnalysisReport {
        AnalysisReport {
            treatment: "X".into(),
            outcome: "Y".into(),
            treatment_levels: BinaryLevels {
                false_value: Some("0".into()),
                true_value: Some("1".into()),
            },
            method: EstimationMethod::PropensityScoreStratification,
            estimand: IdentifiedEstimand {
                estimand_type: EstimandType::NonparametricAte,
                treatment: "X".into(),
                outcome: "Y".into(),
                backdoor_variables: vec!["Z1".into(), "Z2".into()],
                instrumental_variables: vec![],
                effect_modifiers: vec![],
                unobserved_confounders: if identified { vec![] } else { vec!["U".into()] },
                identified,
            },
            ate: estimate(2.0134, TargetUnits::Ate),
            atc: estimate(1.98765, TargetUnits::Atc),
            att: estimate(2.05, TargetUnits::Att),
            random_common_cause: refutation(RefuterKind::RandomCommonCause, 2.011),
            data_subset: refutation(RefuterKind::DataSubset, 2.0249),
            placebo: refutation(RefuterKind::PlaceboTreatment, -0.00123456),
            elapsed_secs: 90.0,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_markdown_layout() {
        let text = report(true).to_markdown();
        assert!(text.starts_with("**Effects**:\n\n| ATE | ATC | ATT |\n| --- | --- | --- |\n| 2.01 | 1.99 | 2.05 |\n"));
        assert!(text.contains("**ATC** - Raising the treatment variable `X` from 0 to 1"));
        assert!(text.contains("causes an increase of **2.05** in the expected value of the outcome"));
        assert!(text.contains(
            "| Estimated effect | Random effect | Subset effect | Placebo effect |\n\
             | --- | --- | --- | --- |\n\
             | 2.01 | 2.01 | 2.02 | -0.00123 |"
        ));
        assert!(text.ends_with("Run time: 1.500 minutes"));
        assert!(!text.contains("**Warning**"));
    }

    #[test]
    fn test_markdown_flags_unidentified_effect() {
        let text = report(false).to_markdown();
        assert!(text.contains("**Warning**"));
        assert!(text.contains("(U)"));
    }

    #[test]
    fn test_markdown_names_treatment_levels() {
        let mut dosed = report(true);
        dosed.treatment_levels = BinaryLevels {
            false_value: Some("0".into()),
            true_value: Some(crate::dataset::NONZERO_LEVEL.into()),
        };
        let text = dosed.to_markdown();
        assert!(text.contains("**ATE** - Raising the treatment variable `X` from 0 to nonzero"));
    }

    #[test]
    fn test_json_contains_all_results() {
        let json = report(true).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ate"]["target_units"], "ate");
        assert_eq!(value["method"], "backdoor.propensity_score_stratification");
        assert_eq!(value["placebo"]["refuter"], "placebo_treatment_refuter");
        assert_eq!(value["estimand"]["backdoor_variables"][1], "Z2");
        assert_eq!(value["treatment_levels"]["true_value"], "1");
    }
}
