//! PostGIS and SpatiaLite.
//!
//! Both dialects expose the same canonical function set (`make_valid`,
//! `geom_from_text`, `buffer`, `is_empty`, `transform` and the eight
//! predicates). SpatiaLite predicates return `1`, `0` or `-1` (error), so they
//! are compared against `1` instead of being used as booleans.

pub mod function_mapper;

use geosieve_common::{DatasetDescriptor, SpatialPredicate};
use once_cell::sync::Lazy;

use crate::error::SqlGenError;
use crate::sanitize::{quote_ident, quote_path};
use function_mapper::{render_call, FunctionMapper};

static POSTGIS: Lazy<FunctionMapper> = Lazy::new(|| {
    FunctionMapper::new()
        .rename("make_valid", "ST_MakeValid")
        .rename("geom_from_text", "ST_GeomFromText")
        .rename("buffer", "ST_Buffer")
        .rename("is_empty", "ST_IsEmpty")
        .rename("transform", "ST_Transform")
        .rename("intersects", "ST_Intersects")
        .rename("contains", "ST_Contains")
        .rename("within", "ST_Within")
        .rename("crosses", "ST_Crosses")
        .rename("overlaps", "ST_Overlaps")
        .rename("touches", "ST_Touches")
        .rename("disjoint", "ST_Disjoint")
        .rename("equals", "ST_Equals")
});

fn spatialite_predicate(name: &'static str) -> impl Fn(&[String]) -> String + Send + Sync {
    move |args| format!("{} = 1", render_call(name, args))
}

static SPATIALITE: Lazy<FunctionMapper> = Lazy::new(|| {
    FunctionMapper::new()
        .rename("make_valid", "MakeValid")
        .rename("geom_from_text", "GeomFromText")
        .rename("buffer", "Buffer")
        .rename("is_empty", "IsEmpty")
        .rename("transform", "Transform")
        .transform("intersects", spatialite_predicate("Intersects"))
        .transform("contains", spatialite_predicate("Contains"))
        .transform("within", spatialite_predicate("Within"))
        .transform("crosses", spatialite_predicate("Crosses"))
        .transform("overlaps", spatialite_predicate("Overlaps"))
        .transform("touches", spatialite_predicate("Touches"))
        .transform("disjoint", spatialite_predicate("Disjoint"))
        .transform("equals", spatialite_predicate("Equals"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    PostGis,
    SpatiaLite,
}

impl SqlDialect {
    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::PostGis => "PostGIS",
            SqlDialect::SpatiaLite => "SpatiaLite",
        }
    }

    pub fn function_mapper(&self) -> &'static FunctionMapper {
        match self {
            SqlDialect::PostGis => &POSTGIS,
            SqlDialect::SpatiaLite => &SPATIALITE,
        }
    }

    /// Render a canonical function call in this dialect.
    pub fn call(&self, func: &str, args: &[String]) -> Result<String, SqlGenError> {
        self.function_mapper().call(func, args)
    }

    /// `predicate(target, source)` as a boolean SQL condition.
    pub fn predicate(
        &self,
        predicate: SpatialPredicate,
        target: &str,
        source: &str,
    ) -> Result<String, SqlGenError> {
        self.call(predicate.as_str(), &[target.to_string(), source.to_string()])
    }

    /// Quoted relation name. PostGIS includes the schema when one is set;
    /// SpatiaLite databases have no schemas.
    pub fn qualified_table(&self, dataset: &DatasetDescriptor) -> Result<String, SqlGenError> {
        self.qualified_relation(dataset.schema.as_deref(), &dataset.table)
    }

    pub fn qualified_relation(
        &self,
        schema: Option<&str>,
        relation: &str,
    ) -> Result<String, SqlGenError> {
        match (self, schema) {
            (SqlDialect::PostGis, Some(schema)) => quote_path(&[schema, relation]),
            _ => quote_ident(relation),
        }
    }

    /// Fully qualified column: `"schema"."table"."column"` (PostGIS) or
    /// `"table"."column"` (SpatiaLite).
    pub fn qualified_column(
        &self,
        dataset: &DatasetDescriptor,
        column: &str,
    ) -> Result<String, SqlGenError> {
        Ok(format!(
            "{}.{}",
            self.qualified_table(dataset)?,
            quote_ident(column)?
        ))
    }

    /// Function names whose presence marks filter text as spatial.
    pub fn spatial_markers(&self) -> Vec<&'static str> {
        match self {
            SqlDialect::PostGis => self.function_mapper().target_names(),
            SqlDialect::SpatiaLite => {
                let mut names = self.function_mapper().target_names();
                names.extend(SpatialPredicate::ALL.iter().map(|p| match p {
                    SpatialPredicate::Intersects => "Intersects",
                    SpatialPredicate::Contains => "Contains",
                    SpatialPredicate::Within => "Within",
                    SpatialPredicate::Crosses => "Crosses",
                    SpatialPredicate::Overlaps => "Overlaps",
                    SpatialPredicate::Touches => "Touches",
                    SpatialPredicate::Disjoint => "Disjoint",
                    SpatialPredicate::Equals => "Equals",
                }));
                names
            }
        }
    }
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosieve_common::ProviderKind;

    #[test]
    fn test_predicate_rendering() {
        assert_eq!(
            SqlDialect::PostGis
                .predicate(SpatialPredicate::Within, "a", "b")
                .unwrap(),
            "ST_Within(a, b)"
        );
        assert_eq!(
            SqlDialect::SpatiaLite
                .predicate(SpatialPredicate::Within, "a", "b")
                .unwrap(),
            "Within(a, b) = 1"
        );
    }

    #[test]
    fn test_every_canonical_function_is_mapped() {
        let canonical = ["make_valid", "geom_from_text", "buffer", "is_empty", "transform"];
        for dialect in [SqlDialect::PostGis, SqlDialect::SpatiaLite] {
            for name in canonical {
                assert!(dialect.function_mapper().has_rule(name), "{} {}", dialect, name);
            }
            for p in SpatialPredicate::ALL {
                assert!(dialect.function_mapper().has_rule(p.as_str()));
            }
        }
    }

    #[test]
    fn test_qualified_names() {
        let ds = DatasetDescriptor::new("roads", ProviderKind::Postgres, "postgres://db", "roads")
            .with_schema("gis");
        assert_eq!(
            SqlDialect::PostGis.qualified_column(&ds, "geom").unwrap(),
            r#""gis"."roads"."geom""#
        );
        assert_eq!(
            SqlDialect::SpatiaLite.qualified_column(&ds, "geom").unwrap(),
            r#""roads"."geom""#
        );
    }
}
