//! One-dimensional meshes.
//!
//! A [`Geometry`] names each spatial domain with its extent and coordinate
//! system. A [`SubmeshGenerator`] turns one domain into a [`Submesh1D`] of
//! cells, and a [`Mesh`] collects the submeshes by domain name.
//!
//! # Example
//!
//! ```ignore
//! let geometry = Geometry::new().with_domain("rod", DomainGeometry::new(0.0, 1.0));
//! let mut generators: BTreeMap<String, Box<dyn SubmeshGenerator>> = BTreeMap::new();
//! generators.insert("rod".to_string(), Box::new(Uniform1D::new(20)));
//! let mesh = Mesh::generate(&geometry, &generators)?;
//! ```

use std::collections::BTreeMap;
use std::fmt;

/// Errors raised while building meshes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeshError {
    /// Edges must be finite and strictly increasing
    #[error("Edges of a submesh must be finite and strictly increasing (failed at index {0})")]
    InvalidEdges(usize),
    /// A submesh needs at least one cell
    #[error("A submesh needs at least one cell, got {0} points")]
    TooFewPoints(usize),
    /// The geometry has no entry for a domain
    #[error("Domain '{0}' is not part of the geometry")]
    UnknownDomain(String),
    /// A domain of the geometry has no submesh generator
    #[error("No submesh generator for domain '{0}'")]
    MissingGenerator(String),
    /// The domain extent is empty or reversed
    #[error("Domain '{name}' has invalid extent [{min}, {max}]")]
    InvalidExtent {
        /// Domain name
        name: String,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
}

/// Coordinate system of a one-dimensional domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinateSystem {
    /// Planar
    #[default]
    Cartesian,
    /// Radial coordinate of a cylinder
    Cylindrical,
    /// Radial coordinate of a sphere
    Spherical,
}

impl fmt::Display for CoordinateSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinateSystem::Cartesian => write!(f, "cartesian"),
            CoordinateSystem::Cylindrical => write!(f, "cylindrical polar"),
            CoordinateSystem::Spherical => write!(f, "spherical polar"),
        }
    }
}

/// Extent and coordinate system of one domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainGeometry {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
    /// Coordinate system
    pub coord_sys: CoordinateSystem,
}

impl DomainGeometry {
    /// Cartesian domain `[min, max]`.
    pub fn new(min: f64, max: f64) -> Self {
        DomainGeometry { min, max, coord_sys: CoordinateSystem::Cartesian }
    }

    /// Sets the coordinate system.
    pub fn with_coord_sys(mut self, coord_sys: CoordinateSystem) -> Self {
        self.coord_sys = coord_sys;
        self
    }
}

/// Domains by name.
#[derive(Debug, Clone, Default)]
pub struct Geometry {
    domains: BTreeMap<String, DomainGeometry>,
}

impl Geometry {
    pub fn new() -> Self {
        Geometry { domains: BTreeMap::new() }
    }

    /// Adds (or replaces) a domain.
    pub fn with_domain(mut self, name: &str, domain: DomainGeometry) -> Self {
        self.domains.insert(name.to_string(), domain);
        self
    }

    pub fn get(&self, name: &str) -> Option<&DomainGeometry> {
        self.domains.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DomainGeometry)> {
        self.domains.iter().map(|(n, d)| (n.as_str(), d))
    }
}

/// A one-dimensional mesh of cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Submesh1D {
    edges: Vec<f64>,
    nodes: Vec<f64>,
    widths: Vec<f64>,
    coord_sys: CoordinateSystem,
}

impl Submesh1D {
    /// Builds a submesh from its cell edges.
    pub fn from_edges(edges: Vec<f64>, coord_sys: CoordinateSystem) -> Result<Self, MeshError> {
        if edges.len() < 2 {
            return Err(MeshError::TooFewPoints(edges.len()));
        }
        for (i, pair) in edges.windows(2).enumerate() {
            if !(pair[0].is_finite() && pair[1].is_finite() && pair[1] > pair[0]) {
                return Err(MeshError::InvalidEdges(i + 1));
            }
        }
        let nodes = edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
        let widths = edges.windows(2).map(|w| w[1] - w[0]).collect();
        Ok(Submesh1D { edges, nodes, widths, coord_sys })
    }

    /// `npts` equal cells spanning `[min, max]`.
    pub fn uniform(min: f64, max: f64, npts: usize) -> Result<Self, MeshError> {
        Uniform1D::new(npts).generate(&DomainGeometry::new(min, max))
    }

    /// Number of cells.
    pub fn npts(&self) -> usize {
        self.nodes.len()
    }

    /// Cell centres.
    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    /// Cell edges, one more than the number of cells.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Cell widths.
    pub fn widths(&self) -> &[f64] {
        &self.widths
    }

    pub fn coord_sys(&self) -> CoordinateSystem {
        self.coord_sys
    }
}

/// Turns a domain extent into a submesh.
pub trait SubmeshGenerator {
    /// Builds the submesh.
    fn generate(&self, domain: &DomainGeometry) -> Result<Submesh1D, MeshError>;
}

fn check_extent(domain: &DomainGeometry) -> Result<(), MeshError> {
    if !(domain.min.is_finite() && domain.max.is_finite() && domain.max > domain.min) {
        return Err(MeshError::InvalidExtent {
            name: String::new(),
            min: domain.min,
            max: domain.max,
        });
    }
    Ok(())
}

/// Equally spaced cells.
#[derive(Debug, Clone, Copy)]
pub struct Uniform1D {
    /// Number of cells
    pub npts: usize,
}

impl Uniform1D {
    pub fn new(npts: usize) -> Self {
        Uniform1D { npts }
    }
}

impl SubmeshGenerator for Uniform1D {
    fn generate(&self, domain: &DomainGeometry) -> Result<Submesh1D, MeshError> {
        if self.npts == 0 {
            return Err(MeshError::TooFewPoints(0));
        }
        check_extent(domain)?;
        let h = (domain.max - domain.min) / self.npts as f64;
        let mut edges: Vec<f64> = (0..=self.npts).map(|i| domain.min + i as f64 * h).collect();
        // Pin the last edge to avoid round-off
        edges[self.npts] = domain.max;
        Submesh1D::from_edges(edges, domain.coord_sys)
    }
}

/// Cells clustered exponentially towards one end of the domain.
#[derive(Debug, Clone, Copy)]
pub struct Exponential1D {
    /// Number of cells
    pub npts: usize,
    /// Clustering strength; larger values give smaller cells at `side`
    pub stretch: f64,
    /// End the cells are clustered towards
    pub side: crate::expression::Side,
}

impl Exponential1D {
    pub fn new(npts: usize, stretch: f64, side: crate::expression::Side) -> Self {
        Exponential1D { npts, stretch, side }
    }
}

impl SubmeshGenerator for Exponential1D {
    fn generate(&self, domain: &DomainGeometry) -> Result<Submesh1D, MeshError> {
        use crate::expression::Side;

        if self.npts == 0 {
            return Err(MeshError::TooFewPoints(0));
        }
        check_extent(domain)?;
        if self.stretch.abs() < 1e-12 {
            return Uniform1D::new(self.npts).generate(domain);
        }
        let a = self.stretch.abs();
        let length = domain.max - domain.min;
        let n = self.npts as f64;
        // Fraction of the domain below edge i, with cells growing away from the left end
        let fraction = |i: usize| ((a * i as f64 / n).exp() - 1.0) / (a.exp() - 1.0);
        let edges: Vec<f64> = match self.side {
            Side::Left => (0..=self.npts).map(|i| domain.min + length * fraction(i)).collect(),
            Side::Right => (0..=self.npts)
                .map(|i| domain.max - length * fraction(self.npts - i))
                .collect(),
        };
        Submesh1D::from_edges(edges, domain.coord_sys)
    }
}

/// Submeshes by domain name.
///
/// The default mesh is empty, which is enough for models without spatial
/// unknowns.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    submeshes: BTreeMap<String, Submesh1D>,
}

impl Mesh {
    /// An empty (point) mesh.
    pub fn new() -> Self {
        Mesh { submeshes: BTreeMap::new() }
    }

    /// Adds (or replaces) the submesh of `domain`.
    pub fn with_submesh(mut self, domain: &str, submesh: Submesh1D) -> Self {
        self.submeshes.insert(domain.to_string(), submesh);
        self
    }

    /// Builds one submesh per geometry domain.
    pub fn generate(
        geometry: &Geometry,
        generators: &BTreeMap<String, Box<dyn SubmeshGenerator>>,
    ) -> Result<Self, MeshError> {
        for name in generators.keys() {
            if geometry.get(name).is_none() {
                return Err(MeshError::UnknownDomain(name.clone()));
            }
        }
        let mut mesh = Mesh::new();
        for (name, domain) in geometry.iter() {
            let generator =
                generators.get(name).ok_or_else(|| MeshError::MissingGenerator(name.to_string()))?;
            let submesh = generator.generate(domain).map_err(|e| match e {
                MeshError::InvalidExtent { min, max, .. } => {
                    MeshError::InvalidExtent { name: name.to_string(), min, max }
                }
                other => other,
            })?;
            log::debug!("Generated {} cells on domain '{}'", submesh.npts(), name);
            mesh.submeshes.insert(name.to_string(), submesh);
        }
        Ok(mesh)
    }

    /// Submesh of `domain`.
    pub fn get(&self, domain: &str) -> Option<&Submesh1D> {
        self.submeshes.get(domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.submeshes.keys().map(String::as_str)
    }
}
