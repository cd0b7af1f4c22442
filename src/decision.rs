use crate::models::{ActiveModel, ResultRow, ScoredAccount};

pub const DEFAULT_MODEL_NAME: &str = "hybrid_default";
pub const DEFAULT_MODEL_VERSION: &str = "1.0.0";
pub const DEFAULT_THRESHOLD: f64 = 0.60;

/// The configured active model, or the documented defaults when the
/// configuration table has no active row.
pub fn active_or_default(configured: Option<ActiveModel>) -> ActiveModel {
    configured.unwrap_or_else(|| ActiveModel {
        model_name: DEFAULT_MODEL_NAME.to_string(),
        model_version: DEFAULT_MODEL_VERSION.to_string(),
        threshold: DEFAULT_THRESHOLD,
    })
}

/// Fuses component scores into one result per account.
///
/// The fused score currently equals the supervised score; the curve
/// score slot stays empty until a fusion formula exists for it. The
/// threshold comparison is inclusive.
pub fn decide(scores: &[ScoredAccount], model: &ActiveModel) -> Vec<ResultRow> {
    scores
        .iter()
        .map(|scored| {
            let fused = scored.score;
            ResultRow {
                cuenta: scored.cuenta.clone(),
                score_supervisado: scored.score,
                score_curvas: None,
                score_hibrido: fused,
                umbral_aplicado: model.threshold,
                decision: fused >= model.threshold,
                model_name: model.model_name.clone(),
                model_version: model.model_version.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(cuenta: &str, score: f64) -> ScoredAccount {
        ScoredAccount {
            cuenta: cuenta.to_string(),
            score,
        }
    }

    #[test]
    fn missing_configuration_uses_defaults() {
        let model = active_or_default(None);
        assert_eq!(model.model_name, "hybrid_default");
        assert_eq!(model.model_version, "1.0.0");
        assert_eq!(model.threshold, 0.60);
    }

    #[test]
    fn configured_model_wins_over_defaults() {
        let configured = ActiveModel {
            model_name: "curvas_logreg".to_string(),
            model_version: "0.1.0".to_string(),
            threshold: 0.55,
        };
        assert_eq!(active_or_default(Some(configured.clone())), configured);
    }

    #[test]
    fn threshold_comparison_is_inclusive() {
        let model = active_or_default(None);
        let rows = decide(&[scored("A-1", 0.60), scored("A-2", 0.5999)], &model);
        assert!(rows[0].decision);
        assert!(!rows[1].decision);
    }

    #[test]
    fn fused_score_mirrors_supervised_and_curve_slot_is_empty() {
        let model = active_or_default(None);
        let rows = decide(&[scored("A-1", 0.73)], &model);
        let row = &rows[0];
        assert_eq!(row.score_supervisado, 0.73);
        assert_eq!(row.score_hibrido, 0.73);
        assert_eq!(row.score_curvas, None);
        assert_eq!(row.umbral_aplicado, 0.60);
        assert_eq!(row.model_name, "hybrid_default");
    }
}
