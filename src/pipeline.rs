//! Derived-variable pipelines.
//!
//! A pipeline stage names its input variables and produces one or more
//! output variables over the same block region. The registry keeps the set
//! of stages acyclic: a stage may consume outputs of other stages, but no
//! stage may (transitively) consume its own outputs.

use crate::coords::BlockCoord;
use crate::error::{Result, VdcError};
use crate::types::VarType;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Region a pipeline is asked to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalcRegion {
    pub timestep: usize,
    pub level: usize,
    pub lod: usize,
    pub bmin: BlockCoord,
    pub bmax: BlockCoord,
    pub block_size: [usize; 3],
}

impl CalcRegion {
    /// Samples in the region's block-major buffers
    pub fn len(&self) -> usize {
        (0..3)
            .map(|i| (self.bmax[i] - self.bmin[i] + 1) * self.block_size[i])
            .product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One stage computing derived variables from other variables
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Variables read by the stage, native or derived
    fn inputs(&self) -> Vec<String>;

    /// Variables produced by the stage
    fn outputs(&self) -> Vec<(String, VarType)>;

    /// Compute every output over `region`.
    ///
    /// `inputs` follows the order of [`Pipeline::inputs`] and each buffer is
    /// block-major over the region. The result must hold one buffer of the
    /// same length per output, in the order of [`Pipeline::outputs`].
    fn calculate(&self, region: &CalcRegion, inputs: &[&[f32]]) -> Result<Vec<Vec<f32>>>;
}

/// The set of registered pipeline stages
#[derive(Default)]
pub struct PipelineRegistry {
    stages: Vec<Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Pipeline>> {
        self.stages.iter().find(|p| p.name() == name).cloned()
    }

    /// Stage producing `varname`
    pub fn producer_of(&self, varname: &str) -> Option<Arc<dyn Pipeline>> {
        self.stages
            .iter()
            .find(|p| p.outputs().iter().any(|(o, _)| o == varname))
            .cloned()
    }

    pub fn is_derived(&self, varname: &str) -> bool {
        self.producer_of(varname).is_some()
    }

    /// Type of a derived variable
    pub fn var_type(&self, varname: &str) -> Option<VarType> {
        self.stages
            .iter()
            .flat_map(|p| p.outputs())
            .find(|(o, _)| o == varname)
            .map(|(_, t)| t)
    }

    /// Every variable produced by a registered stage
    pub fn derived_variables(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|p| p.outputs().into_iter().map(|(o, _)| o))
            .collect()
    }

    /// Add a stage.
    ///
    /// A stage with the same name is replaced, but only if the new stage is
    /// accepted. Outputs may not collide with outputs of other stages or
    /// with `native` variable names, and the stage may not close a cycle.
    pub fn register(&mut self, pipeline: Arc<dyn Pipeline>, native: &[String]) -> Result<()> {
        let name = pipeline.name().to_string();
        let outputs = pipeline.outputs();
        if outputs.is_empty() {
            return Err(VdcError::Pipeline(format!("pipeline {} has no outputs", name)));
        }

        let others: Vec<Arc<dyn Pipeline>> = self.stages.iter().filter(|p| p.name() != name).cloned().collect();

        for (out, _) in &outputs {
            if others.iter().any(|p| p.outputs().iter().any(|(o, _)| o == out)) {
                return Err(VdcError::Pipeline(format!("pipeline output {} already in use", out)));
            }
            if native.iter().any(|n| n == out) {
                return Err(VdcError::Pipeline(format!(
                    "pipeline output {} matches native variable name",
                    out
                )));
            }
        }

        let mut candidate = others.clone();
        candidate.push(pipeline.clone());
        let graph = dependency_graph(&candidate);
        if has_cycle(&graph, &name) {
            return Err(VdcError::Pipeline(format!(
                "pipeline {} introduces a circular dependency",
                name
            )));
        }

        info!(pipeline = %name, "registered pipeline");
        self.stages = candidate;
        Ok(())
    }

    /// Remove a stage by name, returning it
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Pipeline>> {
        let pos = self.stages.iter().position(|p| p.name() == name)?;
        Some(self.stages.remove(pos))
    }

    pub fn clear(&mut self) {
        self.stages.clear();
    }
}

/// Map each stage name to the stages whose outputs it consumes
fn dependency_graph(stages: &[Arc<dyn Pipeline>]) -> HashMap<String, Vec<String>> {
    let mut graph = HashMap::new();
    for a in stages {
        let inputs = a.inputs();
        let depends = stages
            .iter()
            .filter(|b| b.outputs().iter().any(|(o, _)| inputs.contains(o)))
            .map(|b| b.name().to_string())
            .collect();
        graph.insert(a.name().to_string(), depends);
    }
    graph
}

/// True if `start` is reachable from its own dependencies
fn has_cycle(graph: &HashMap<String, Vec<String>>, start: &str) -> bool {
    let mut visited: Vec<&str> = Vec::new();
    let mut stack: Vec<&str> = graph
        .get(start)
        .map(|d| d.iter().map(String::as_str).collect())
        .unwrap_or_default();
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if visited.contains(&node) {
            continue;
        }
        visited.push(node);
        if let Some(deps) = graph.get(node) {
            stack.extend(deps.iter().map(String::as_str));
        }
    }
    false
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Stage computing `scale * sum(inputs)` into each output
    pub(crate) struct ScaleSum {
        pub name: String,
        pub inputs: Vec<String>,
        pub outputs: Vec<String>,
        pub scale: f32,
    }

    impl ScaleSum {
        pub(crate) fn new(name: &str, inputs: &[&str], outputs: &[&str], scale: f32) -> Arc<dyn Pipeline> {
            Arc::new(Self {
                name: name.to_string(),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
                scale,
            })
        }
    }

    impl Pipeline for ScaleSum {
        fn name(&self) -> &str {
            &self.name
        }

        fn inputs(&self) -> Vec<String> {
            self.inputs.clone()
        }

        fn outputs(&self) -> Vec<(String, VarType)> {
            self.outputs.iter().map(|o| (o.clone(), VarType::Var3D)).collect()
        }

        fn calculate(&self, region: &CalcRegion, inputs: &[&[f32]]) -> Result<Vec<Vec<f32>>> {
            let mut out = vec![0.0; region.len()];
            for input in inputs {
                for (o, v) in out.iter_mut().zip(input.iter()) {
                    *o += v;
                }
            }
            out.iter_mut().for_each(|v| *v *= self.scale);
            Ok(vec![out; self.outputs.len()])
        }
    }

    fn native() -> Vec<String> {
        vec!["x".to_string(), "u".to_string()]
    }

    #[test]
    fn test_cycle_rejected() {
        let mut reg = PipelineRegistry::new();
        reg.register(ScaleSum::new("A", &["x"], &["y"], 1.0), &[]).unwrap();
        let err = reg.register(ScaleSum::new("B", &["y"], &["x"], 1.0), &[]);
        assert!(matches!(err, Err(VdcError::Pipeline(_))));
        assert_eq!(reg.names(), vec!["A"]);
    }

    #[test]
    fn test_longer_cycle_rejected() {
        let mut reg = PipelineRegistry::new();
        reg.register(ScaleSum::new("A", &["c"], &["a"], 1.0), &[]).unwrap();
        reg.register(ScaleSum::new("B", &["a"], &["b"], 1.0), &[]).unwrap();
        assert!(reg.register(ScaleSum::new("C", &["b"], &["c"], 1.0), &[]).is_err());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut reg = PipelineRegistry::new();
        assert!(reg.register(ScaleSum::new("A", &["a"], &["a"], 1.0), &[]).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_collisions() {
        let mut reg = PipelineRegistry::new();
        reg.register(ScaleSum::new("A", &["x"], &["y"], 1.0), &native()).unwrap();
        assert!(reg.register(ScaleSum::new("B", &["x"], &["y"], 2.0), &native()).is_err());
        assert!(reg.register(ScaleSum::new("C", &["y"], &["u"], 2.0), &native()).is_err());
        assert_eq!(reg.names(), vec!["A"]);
    }

    #[test]
    fn test_replace_same_name() {
        let mut reg = PipelineRegistry::new();
        reg.register(ScaleSum::new("A", &["x"], &["y"], 1.0), &native()).unwrap();
        reg.register(ScaleSum::new("A", &["x"], &["y", "z"], 2.0), &native()).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.is_derived("z"));

        // a rejected replacement leaves the old stage in place
        assert!(reg.register(ScaleSum::new("A", &["y"], &["y"], 1.0), &native()).is_err());
        assert!(reg.is_derived("z"));
    }

    #[test]
    fn test_chain_and_remove() {
        let mut reg = PipelineRegistry::new();
        reg.register(ScaleSum::new("A", &["x"], &["y"], 1.0), &native()).unwrap();
        reg.register(ScaleSum::new("B", &["y", "u"], &["w"], 1.0), &native()).unwrap();
        assert_eq!(reg.producer_of("w").unwrap().name(), "B");
        assert_eq!(reg.var_type("w"), Some(VarType::Var3D));
        assert!(reg.remove("A").is_some());
        assert!(!reg.is_derived("y"));
        assert!(reg.remove("A").is_none());
    }
}
