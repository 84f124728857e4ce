use geosieve_common::warnings::add_warning;
use geosieve_common::{BackendKind, DatasetDescriptor, FilterSpec, SourceGeometry};
use geosieve_error::{Result, SieveError};
use geosieve_geometry::prepare_literals;
use geosieve_sql::spatial::find_auxiliary;
use geosieve_sql::{validate_expression, SpatialClauseBuilder, SqlDialect, SqlGenError};
use tracing::debug;

/// The SQL a database backend has to run for one filter step.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStep {
    /// New filter clause: the spatial clause AND-ed with the attribute
    /// condition. `None` when the step provably matches nothing.
    pub clause: Option<String>,
    /// Single-integer query that must return a non-zero count before
    /// `clause` is worth running (eroded dataset sources).
    pub probe: Option<String>,
}

impl SqlStep {
    fn nothing() -> Self {
        Self {
            clause: None,
            probe: None,
        }
    }
}

pub(crate) fn sql_error(dialect: SqlDialect) -> impl Fn(SqlGenError) -> SieveError {
    move |e| e.to_sieve_error(dialect.name())
}

/// Validate the request and build the SQL for it.
///
/// Literal sources are repaired and buffered in-process first: literals that
/// cannot be parsed or repaired are skipped with a warning, and a source
/// whose every literal eroded away short-circuits to an empty step.
pub fn plan_sql_step(
    dialect: SqlDialect,
    kind: BackendKind,
    spec: &FilterSpec,
    target: &DatasetDescriptor,
    auxiliary: &[DatasetDescriptor],
) -> Result<SqlStep> {
    let to_sieve = sql_error(dialect);
    let condition = spec.condition_for(kind);
    if let Some(condition) = condition {
        validate_expression(condition).map_err(&to_sieve)?;
    }

    if spec.source.is_some() && spec.predicates.is_empty() {
        return Err(to_sieve(SqlGenError::NoPredicates));
    }

    let Some(source) = spec.source.as_ref().filter(|_| spec.is_spatial()) else {
        return match condition {
            Some(condition) => Ok(SqlStep {
                clause: Some(condition.to_string()),
                probe: None,
            }),
            None => Err(SieveError::expression(
                "The filter has neither an attribute condition nor a spatial source",
            )),
        };
    };

    let buffer = spec.effective_buffer();
    let builder = SpatialClauseBuilder::new(dialect, target)
        .with_predicates(&spec.predicates)
        .with_buffer(buffer);

    let (spatial, probe) = match source {
        SourceGeometry::Literal { wkts, srid } => {
            if buffer.is_some_and(|b| b.constant_distance().is_none()) {
                // Rejected by the builder with a precise message.
                builder.literal_clause(wkts, *srid).map_err(&to_sieve)?;
            }
            let prepared = prepare_literals(wkts, buffer.and_then(|b| b.constant_distance()));
            for skipped in &prepared.skipped {
                add_warning(format!("Skipped source geometry: {}", skipped.message));
            }
            if prepared.all_failed() {
                let first = prepared.skipped.into_iter().next();
                return Err(first.unwrap_or_else(|| {
                    SieveError::internal("no usable source geometry")
                }));
            }
            if prepared.is_empty() {
                debug!(
                    target: "backend",
                    dataset = %target.id,
                    eroded = prepared.eroded,
                    "Every source geometry eroded away"
                );
                return Ok(SqlStep::nothing());
            }
            let clause = builder
                .literal_clause(&prepared.wkts, *srid)
                .map_err(&to_sieve)?;
            (clause, None)
        }
        SourceGeometry::Dataset { dataset_id, .. } => {
            let aux = find_auxiliary(dataset_id, auxiliary).map_err(&to_sieve)?;
            if aux.provider != target.provider || aux.source != target.source {
                return Err(SieveError::new(
                    geosieve_error::ErrorCode::UnsupportedDataset,
                    format!(
                        "Source dataset '{}' does not live in the same database as '{}'",
                        aux.id, target.id
                    ),
                ));
            }
            let clause = builder.build(source, auxiliary).map_err(&to_sieve)?;
            let probe = if buffer.is_some_and(|b| b.is_erosion()) {
                Some(
                    builder
                        .emptiness_probe(source, auxiliary)
                        .map_err(&to_sieve)?,
                )
            } else {
                None
            };
            (clause, probe)
        }
    };

    let clause = match condition {
        Some(condition) => format!("({}) AND ({})", condition, spatial),
        None => spatial,
    };
    Ok(SqlStep {
        clause: Some(clause),
        probe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosieve_common::{BufferSpec, ProviderKind, SpatialPredicate};
    use geosieve_common::warnings::collect_warnings;
    use geosieve_error::ErrorCode;

    fn roads() -> DatasetDescriptor {
        DatasetDescriptor::new("roads", ProviderKind::Postgres, "host=db", "roads")
            .with_schema("public")
            .with_srid(4326)
    }

    #[test]
    fn test_attribute_only_step() {
        let spec = FilterSpec::new().with_condition("speed > 50");
        let step = plan_sql_step(SqlDialect::PostGis, BackendKind::Relational, &spec, &roads(), &[])
            .unwrap();
        assert_eq!(step.clause.as_deref(), Some("speed > 50"));
        assert!(step.probe.is_none());
    }

    #[test]
    fn test_rejects_bad_condition_and_missing_predicates() {
        let spec = FilterSpec::new().with_condition("speed >");
        let err = plan_sql_step(SqlDialect::PostGis, BackendKind::Relational, &spec, &roads(), &[])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidExpression);

        let spec = FilterSpec::new().with_literal_source(["POINT(1 1)"]);
        let err = plan_sql_step(SqlDialect::PostGis, BackendKind::Relational, &spec, &roads(), &[])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedPredicate);

        let err = plan_sql_step(
            SqlDialect::PostGis,
            BackendKind::Relational,
            &FilterSpec::new(),
            &roads(),
            &[],
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidExpression);
    }

    #[tokio::test]
    async fn test_literal_source_skips_garbage_with_warning() {
        let spec = FilterSpec::new()
            .with_predicate(SpatialPredicate::Intersects)
            .with_literal_source(["POINT(1 1)", "POLYGON((0 0, 1"])
            .with_condition("speed > 50");
        let (step, warnings) = collect_warnings(async {
            plan_sql_step(SqlDialect::PostGis, BackendKind::Relational, &spec, &roads(), &[])
        })
        .await;
        let clause = step.unwrap().clause.unwrap();
        assert!(clause.starts_with("(speed > 50) AND ("));
        assert!(clause.contains("ST_Intersects"));
        assert!(!clause.contains("POLYGON"));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_literal_source_all_garbage_is_error() {
        let spec = FilterSpec::new()
            .with_predicate(SpatialPredicate::Intersects)
            .with_literal_source(["not a geometry"]);
        let err = plan_sql_step(SqlDialect::PostGis, BackendKind::Relational, &spec, &roads(), &[])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidGeometry);
    }

    #[test]
    fn test_eroded_literal_matches_nothing() {
        let spec = FilterSpec::new()
            .with_predicate(SpatialPredicate::Intersects)
            .with_literal_source(["POLYGON((0 0, 30 0, 30 500, 0 500, 0 0))"])
            .with_buffer(BufferSpec::constant(-60.0));
        let step = plan_sql_step(SqlDialect::PostGis, BackendKind::Relational, &spec, &roads(), &[])
            .unwrap();
        assert_eq!(step, SqlStep::nothing());
    }

    #[test]
    fn test_dataset_source_must_share_database() {
        let zones = DatasetDescriptor::new("zones", ProviderKind::Postgres, "host=other", "zones");
        let spec = FilterSpec::new()
            .with_predicate(SpatialPredicate::Within)
            .with_source(SourceGeometry::Dataset {
                dataset_id: "zones".into(),
                filter: None,
                revision: 0,
            });
        let err = plan_sql_step(
            SqlDialect::PostGis,
            BackendKind::Relational,
            &spec,
            &roads(),
            &[zones],
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedDataset);
    }

    #[test]
    fn test_eroded_dataset_source_gets_probe() {
        let zones = DatasetDescriptor::new("zones", ProviderKind::Postgres, "host=db", "zones")
            .with_schema("public");
        let spec = FilterSpec::new()
            .with_predicate(SpatialPredicate::Within)
            .with_source(SourceGeometry::Dataset {
                dataset_id: "zones".into(),
                filter: Some("kind = 'park'".into()),
                revision: 0,
            })
            .with_buffer(BufferSpec::constant(-5.0));
        let step = plan_sql_step(
            SqlDialect::PostGis,
            BackendKind::Relational,
            &spec,
            &roads(),
            &[zones],
        )
        .unwrap();
        assert!(step.clause.unwrap().starts_with("EXISTS (SELECT 1 FROM"));
        let probe = step.probe.unwrap();
        assert!(probe.starts_with("SELECT COUNT(*)"));
        assert!(probe.contains("kind = 'park'"));
    }
}
