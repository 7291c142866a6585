//! In-memory copy of a hierarchical model file.
//!
//! Every dataset becomes an `f64` array and every group a mapping from member
//! name to node. The structure is not interpreted here; that happens in
//! [`super::model`].

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayD, Ix2};

use crate::error::{EmulatorError, Result};

/// A node in the model tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A group of named members
    Group(BTreeMap<String, Node>),
    /// A numeric dataset
    Dataset(ArrayD<f64>),
}

/// A group node together with the path it was found at, for error messages.
#[derive(Debug, Clone)]
pub(crate) struct GroupRef<'a> {
    path: String,
    members: &'a BTreeMap<String, Node>,
}

impl Node {
    /// An empty group.
    pub fn group() -> Self {
        Node::Group(BTreeMap::new())
    }

    /// Insert a member, returning the group for chaining. Does nothing to a
    /// dataset.
    pub fn with(mut self, name: impl Into<String>, child: impl Into<Node>) -> Self {
        if let Node::Group(members) = &mut self {
            members.insert(name.into(), child.into());
        }
        self
    }

    pub(crate) fn as_root(&self) -> Result<GroupRef<'_>> {
        match self {
            Node::Group(members) => Ok(GroupRef {
                path: String::new(),
                members,
            }),
            Node::Dataset(_) => Err(EmulatorError::Load(
                "model file root is a dataset, not a group".into(),
            )),
        }
    }
}

impl From<ArrayD<f64>> for Node {
    fn from(array: ArrayD<f64>) -> Self {
        Node::Dataset(array)
    }
}

impl From<Array1<f64>> for Node {
    fn from(array: Array1<f64>) -> Self {
        Node::Dataset(array.into_dyn())
    }
}

impl From<Array2<f64>> for Node {
    fn from(array: Array2<f64>) -> Self {
        Node::Dataset(array.into_dyn())
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Node::Dataset(ndarray::arr0(value).into_dyn())
    }
}

impl<'a> GroupRef<'a> {
    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &'a str> {
        self.members.keys().map(String::as_str)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    fn child(&self, name: &str) -> Result<(String, &'a Node)> {
        let path = format!("{}/{name}", self.path);
        match self.members.get(name) {
            Some(node) => Ok((path, node)),
            None => Err(EmulatorError::Load(format!(
                "missing required entry `{path}`"
            ))),
        }
    }

    /// A child group.
    pub(crate) fn group(&self, name: &str) -> Result<GroupRef<'a>> {
        match self.child(name)? {
            (path, Node::Group(members)) => Ok(GroupRef { path, members }),
            (path, Node::Dataset(_)) => Err(EmulatorError::Load(format!(
                "`{path}` is a dataset, expected a group"
            ))),
        }
    }

    /// A child dataset of any dimensionality.
    pub(crate) fn dataset(&self, name: &str) -> Result<&'a ArrayD<f64>> {
        match self.child(name)? {
            (_, Node::Dataset(array)) => Ok(array),
            (path, Node::Group(_)) => Err(EmulatorError::Load(format!(
                "`{path}` is a group, expected a dataset"
            ))),
        }
    }

    /// A child dataset as a vector. Scalars are read as one-element vectors.
    pub(crate) fn vector(&self, name: &str) -> Result<Array1<f64>> {
        let array = self.dataset(name)?;
        match array.ndim() {
            0 | 1 => Ok(array.iter().copied().collect()),
            _ => Err(EmulatorError::Load(format!(
                "`{}/{name}` has shape {:?}, expected a vector",
                self.path,
                array.shape()
            ))),
        }
    }

    /// A child dataset as a matrix.
    pub(crate) fn matrix(&self, name: &str) -> Result<Array2<f64>> {
        let array = self.dataset(name)?;
        array.clone().into_dimensionality::<Ix2>().map_err(|_| {
            EmulatorError::Load(format!(
                "`{}/{name}` has shape {:?}, expected a matrix",
                self.path,
                array.shape()
            ))
        })
    }
}

/// Reading the tree from an HDF5 file.
#[cfg(feature = "hdf5")]
mod h5 {
    use log::debug;

    use super::*;

    impl Node {
        /// Read every group and numeric dataset of an HDF5 file.
        pub fn from_hdf5(path: impl AsRef<std::path::Path>) -> Result<Self> {
            let path = path.as_ref();
            let file = hdf5::File::open(path).map_err(|e| {
                EmulatorError::Load(format!("can't open {}: {e}", path.display()))
            })?;
            read_group(&file)
        }
    }

    fn read_group(group: &hdf5::Group) -> Result<Node> {
        let load_err = |e: hdf5::Error| EmulatorError::Load(format!("{}: {e}", group.name()));

        let mut members = BTreeMap::new();
        for name in group.member_names().map_err(load_err)? {
            if let Ok(dataset) = group.dataset(&name) {
                match dataset.read_dyn::<f64>() {
                    Ok(array) => {
                        members.insert(name, Node::Dataset(array));
                    }
                    Err(e) => debug!("skipping non-numeric dataset {}: {e}", dataset.name()),
                }
            } else {
                let child = group.group(&name).map_err(load_err)?;
                members.insert(name, read_group(&child)?);
            }
        }
        Ok(Node::Group(members))
    }
}
