//! Spatial clause generation.
//!
//! Every source geometry is wrapped in the dialect's repair function before
//! it is buffered or compared, so invalid input (self-intersections, unclosed
//! rings) cannot silently match nothing:
//!
//! ```text
//! pred(target_geom, buffer(repair(source_geom), distance, segments))
//! ```
//!
//! Multiple predicates are OR-ed. Literal sources contribute one term per
//! geometry; a dataset source becomes a correlated `EXISTS` over the source
//! table aliased as `"src"`.

use geosieve_common::{
    BufferDistance, BufferSpec, DatasetDescriptor, SourceGeometry, SpatialPredicate,
};

use crate::condition::validate_expression;
use crate::dialects::SqlDialect;
use crate::error::SqlGenError;
use crate::filter::MATCH_NOTHING;
use crate::sanitize::{quote_ident, quote_literal};

/// Alias of the source table inside dataset-source subqueries.
pub const SOURCE_ALIAS: &str = "src";

#[derive(Debug, Clone)]
pub struct SpatialClauseBuilder<'a> {
    dialect: SqlDialect,
    target: &'a DatasetDescriptor,
    predicates: Vec<SpatialPredicate>,
    buffer: Option<&'a BufferSpec>,
}

impl<'a> SpatialClauseBuilder<'a> {
    pub fn new(dialect: SqlDialect, target: &'a DatasetDescriptor) -> Self {
        Self {
            dialect,
            target,
            predicates: Vec::new(),
            buffer: None,
        }
    }

    pub fn with_predicates<'p, I>(mut self, predicates: I) -> Self
    where
        I: IntoIterator<Item = &'p SpatialPredicate>,
    {
        self.predicates = predicates.into_iter().copied().collect();
        self.predicates.sort();
        self.predicates.dedup();
        self
    }

    /// A zero buffer is ignored.
    pub fn with_buffer(mut self, buffer: Option<&'a BufferSpec>) -> Self {
        self.buffer = buffer.filter(|b| !b.is_noop());
        self
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn target_geometry(&self) -> Result<String, SqlGenError> {
        self.dialect
            .qualified_column(self.target, &self.target.geometry_column)
    }

    fn buffer_distance(&self) -> Result<Option<(String, u32)>, SqlGenError> {
        let Some(buffer) = self.buffer else {
            return Ok(None);
        };
        let distance = match &buffer.distance {
            BufferDistance::Constant(d) if !d.is_finite() => {
                return Err(SqlGenError::InvalidBuffer(format!("distance {} is not finite", d)))
            }
            BufferDistance::Constant(d) => format!("{}", d),
            BufferDistance::Expression(expr) => {
                validate_expression(expr)?;
                format!("({})", expr.trim())
            }
        };
        Ok(Some((distance, buffer.segments.max(1))))
    }

    /// `buffer?(repair(geometry))`, reprojected to the target SRID when the
    /// source declares a different one.
    pub fn source_expression(
        &self,
        geometry_sql: &str,
        source_srid: Option<i32>,
    ) -> Result<String, SqlGenError> {
        let mut expr = self.dialect.call("make_valid", &[geometry_sql.to_string()])?;
        if let (Some(from), Some(to)) = (source_srid, self.target.srid) {
            if from != to {
                expr = self.dialect.call("transform", &[expr, to.to_string()])?;
            }
        }
        if let Some((distance, segments)) = self.buffer_distance()? {
            expr = self
                .dialect
                .call("buffer", &[expr, distance, segments.to_string()])?;
        }
        Ok(expr)
    }

    /// `GeomFromText('wkt', srid)`. An EWKT `SRID=n;` prefix overrides
    /// `srid`.
    pub fn literal_geometry(&self, wkt: &str, srid: Option<i32>) -> Result<String, SqlGenError> {
        let (ewkt_srid, body) = split_ewkt(wkt);
        let srid = ewkt_srid.or(srid).or(self.target.srid);
        let mut args = vec![quote_literal(body)?];
        if let Some(srid) = srid {
            args.push(srid.to_string());
        }
        self.dialect.call("geom_from_text", &args)
    }

    fn predicate_terms(&self, source_expr: &str) -> Result<Vec<String>, SqlGenError> {
        let target = self.target_geometry()?;
        self.predicates
            .iter()
            .map(|p| self.dialect.predicate(*p, &target, source_expr))
            .collect()
    }

    fn require_predicates(&self) -> Result<(), SqlGenError> {
        if self.predicates.is_empty() {
            return Err(SqlGenError::NoPredicates);
        }
        Ok(())
    }

    /// Clause for caller-supplied WKT geometries. No geometries means no
    /// match.
    pub fn literal_clause(&self, wkts: &[String], srid: Option<i32>) -> Result<String, SqlGenError> {
        self.require_predicates()?;
        if self
            .buffer
            .is_some_and(|b| matches!(b.distance, BufferDistance::Expression(_)))
        {
            return Err(SqlGenError::InvalidBuffer(
                "per-feature buffer expressions need a dataset source".to_string(),
            ));
        }
        if wkts.is_empty() {
            return Ok(MATCH_NOTHING.to_string());
        }

        let mut terms = Vec::with_capacity(wkts.len() * self.predicates.len());
        for wkt in wkts {
            let geom = self.literal_geometry(wkt, srid)?;
            let source = self.source_expression(&geom, split_ewkt(wkt).0.or(srid))?;
            terms.extend(self.predicate_terms(&source)?);
        }
        Ok(join_or(terms))
    }

    fn aux_source_expression(&self, aux: &DatasetDescriptor) -> Result<String, SqlGenError> {
        let geom = format!(
            "{}.{}",
            quote_ident(SOURCE_ALIAS)?,
            quote_ident(&aux.geometry_column)?
        );
        self.source_expression(&geom, aux.srid)
    }

    /// Correlated `EXISTS` over the features of `aux`, restricted by its
    /// filter when one is given.
    pub fn dataset_clause(
        &self,
        aux: &DatasetDescriptor,
        aux_filter: Option<&str>,
    ) -> Result<String, SqlGenError> {
        self.require_predicates()?;
        let source = self.aux_source_expression(aux)?;
        let mut condition = format!("({})", self.predicate_terms(&source)?.join(" OR "));
        if let Some(filter) = aux_filter.map(str::trim).filter(|f| !f.is_empty()) {
            condition = format!("{} AND ({})", condition, filter);
        }
        Ok(format!(
            "EXISTS (SELECT 1 FROM {} AS {} WHERE {})",
            self.dialect.qualified_table(aux)?,
            quote_ident(SOURCE_ALIAS)?,
            condition
        ))
    }

    /// Clause for any source. Dataset sources are looked up in `auxiliary`;
    /// their own applied filter is used unless the source overrides it.
    pub fn build(
        &self,
        source: &SourceGeometry,
        auxiliary: &[DatasetDescriptor],
    ) -> Result<String, SqlGenError> {
        match source {
            SourceGeometry::Literal { wkts, srid } => self.literal_clause(wkts, *srid),
            SourceGeometry::Dataset {
                dataset_id, filter, ..
            } => {
                let aux = find_auxiliary(dataset_id, auxiliary)?;
                let aux_filter = filter.as_deref().or(aux.current_filter());
                self.dataset_clause(aux, aux_filter)
            }
        }
    }

    /// Query returning a single integer: how many source geometries are still
    /// non-empty after repair and buffering. Zero means the step can only
    /// match nothing.
    pub fn emptiness_probe(
        &self,
        source: &SourceGeometry,
        auxiliary: &[DatasetDescriptor],
    ) -> Result<String, SqlGenError> {
        match source {
            SourceGeometry::Literal { wkts, srid } => {
                if wkts.is_empty() {
                    return Ok("SELECT CAST(0 AS BIGINT)".to_string());
                }
                let mut terms = Vec::with_capacity(wkts.len());
                for wkt in wkts {
                    let geom = self.literal_geometry(wkt, *srid)?;
                    let expr = self.source_expression(&geom, split_ewkt(wkt).0.or(*srid))?;
                    terms.push(format!(
                        "CASE WHEN {} THEN 0 ELSE 1 END",
                        self.dialect.call("is_empty", &[expr])?
                    ));
                }
                Ok(format!("SELECT CAST({} AS BIGINT)", terms.join(" + ")))
            }
            SourceGeometry::Dataset {
                dataset_id, filter, ..
            } => {
                let aux = find_auxiliary(dataset_id, auxiliary)?;
                let expr = self.aux_source_expression(aux)?;
                let mut sql = format!(
                    "SELECT COUNT(*) FROM {} AS {} WHERE NOT ({})",
                    self.dialect.qualified_table(aux)?,
                    quote_ident(SOURCE_ALIAS)?,
                    self.dialect.call("is_empty", &[expr])?
                );
                if let Some(f) = filter
                    .as_deref()
                    .or(aux.current_filter())
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                {
                    sql.push_str(&format!(" AND ({})", f));
                }
                Ok(sql)
            }
        }
    }
}

pub fn find_auxiliary<'d>(
    dataset_id: &str,
    auxiliary: &'d [DatasetDescriptor],
) -> Result<&'d DatasetDescriptor, SqlGenError> {
    auxiliary
        .iter()
        .find(|d| d.id == dataset_id)
        .ok_or_else(|| SqlGenError::MissingAuxiliary(dataset_id.to_string()))
}

fn join_or(terms: Vec<String>) -> String {
    match terms.len() {
        1 => terms.into_iter().next().unwrap_or_default(),
        _ => format!("({})", terms.join(" OR ")),
    }
}

fn split_ewkt(text: &str) -> (Option<i32>, &str) {
    let trimmed = text.trim();
    if trimmed.len() > 5 && trimmed[..5].eq_ignore_ascii_case("SRID=") {
        if let Some((srid, rest)) = trimmed[5..].split_once(';') {
            return (srid.trim().parse().ok(), rest.trim());
        }
    }
    (None, trimmed)
}
