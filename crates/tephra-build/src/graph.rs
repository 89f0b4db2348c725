//! Build Graph
//!
//! An explicit directed acyclic graph of build nodes, constructed
//! eagerly before any execution. Each node owns its definition; child
//! nodes reference parent outputs by node key and value name, never by
//! copy, until the orchestrator resolves them from the shared output
//! map in topological order.

use ahash::{AHashMap, AHashSet};

use tephra_cache::{BuildCachePolicy, CachePolicy, ContentHash, ValueId};

use crate::error::{BuildError, BuildResult};
use crate::key::{compute_settings_suffix, KeyWriter};
use crate::settings::{resolved_mip_count, BuildSettings, TextureEngineParameters};

/// A node is identified by the hash of its definition
pub type NodeKey = ContentHash;

/// The unit of work a node performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildFunction {
    /// Base build: mips + encode, linear layout
    LinearTexture,
    /// Base build: virtual-texture tiles and chunks
    VirtualTexture,
    /// Platform tiling of a parent's linear output
    Tile { tiler: String },
    /// Back to linear from a tiled parent
    Detile { tiler: String },
    /// Decode encoded output to raw pixels for CPU use
    Decode,
}

impl BuildFunction {
    fn tag(&self) -> u8 {
        match self {
            Self::LinearTexture => 0,
            Self::VirtualTexture => 1,
            Self::Tile { .. } => 2,
            Self::Detile { .. } => 3,
            Self::Decode => 4,
        }
    }

    /// Diagnostic name, used in error context
    pub fn name(&self) -> String {
        match self {
            Self::LinearTexture => "LinearTexture".to_string(),
            Self::VirtualTexture => "VirtualTexture".to_string(),
            Self::Tile { tiler } => format!("Tile<{tiler}>"),
            Self::Detile { tiler } => format!("Detile<{tiler}>"),
            Self::Decode => "Decode".to_string(),
        }
    }
}

/// Where a declared input comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Raw bulk data identified by content hash
    Bulk(ContentHash),
    /// A named output value of another node
    NodeValue { node: NodeKey, value: ValueId },
}

/// One declared input of a build definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInput {
    pub name: String,
    pub source: InputSource,
}

/// A build definition: function, constants, and declared inputs.
/// The definition alone determines the node key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDefinition {
    pub function: BuildFunction,
    pub constants: Vec<(String, Vec<u8>)>,
    pub inputs: Vec<BuildInput>,
}

impl BuildDefinition {
    /// Content hash over the function, constants and inputs
    pub fn key(&self) -> NodeKey {
        let mut writer = KeyWriter::new();
        writer.write_u8(self.function.tag());
        writer.write_str(&self.function.name());
        writer.write_u32(self.constants.len() as u32);
        for (name, bytes) in &self.constants {
            writer.write_str(name);
            writer.write_u32(bytes.len() as u32);
            writer.write_bytes(bytes);
        }
        writer.write_u32(self.inputs.len() as u32);
        for input in &self.inputs {
            writer.write_str(&input.name);
            match &input.source {
                InputSource::Bulk(hash) => {
                    writer.write_u8(0);
                    writer.write_hash(hash);
                }
                InputSource::NodeValue { node, value } => {
                    writer.write_u8(1);
                    writer.write_hash(node);
                    writer.write_str(&value.name());
                }
            }
        }
        ContentHash::of(&writer.finish())
    }

    /// Keys of the nodes this definition depends on
    pub fn parent_nodes(&self) -> Vec<NodeKey> {
        let mut parents: Vec<NodeKey> = self
            .inputs
            .iter()
            .filter_map(|input| match &input.source {
                InputSource::NodeValue { node, .. } => Some(*node),
                InputSource::Bulk(_) => None,
            })
            .collect();
        parents.dedup();
        parents
    }
}

/// A definition plus execution policy
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub definition: BuildDefinition,
    pub policy: BuildCachePolicy,
    /// Node whose result substitutes for this one's metadata if this
    /// node errors; the terminal error is still surfaced
    pub fallback: Option<NodeKey>,
}

/// Eagerly-constructed DAG of build nodes
#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: Vec<(NodeKey, BuildNode)>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: BuildNode) -> NodeKey {
        let key = node.definition.key();
        self.nodes.push((key, node));
        key
    }

    pub fn get(&self, key: &NodeKey) -> Option<&BuildNode> {
        self.nodes.iter().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeKey, &BuildNode)> {
        self.nodes.iter().map(|(k, n)| (k, n))
    }

    /// Topological execution order (Kahn). Parents always precede
    /// children; a cycle is a graph construction bug and fails.
    pub fn topological_order(&self) -> BuildResult<Vec<NodeKey>> {
        let known: AHashSet<NodeKey> = self.nodes.iter().map(|(k, _)| *k).collect();
        let mut in_degree: AHashMap<NodeKey, usize> = AHashMap::new();
        let mut dependents: AHashMap<NodeKey, Vec<NodeKey>> = AHashMap::new();

        for (key, node) in &self.nodes {
            let parents: Vec<NodeKey> = node
                .definition
                .parent_nodes()
                .into_iter()
                .filter(|p| known.contains(p))
                .collect();
            in_degree.insert(*key, parents.len());
            for parent in parents {
                dependents.entry(parent).or_default().push(*key);
            }
        }

        let mut ready: Vec<NodeKey> = self
            .nodes
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| in_degree[k] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(key) = ready.pop() {
            order.push(key);
            if let Some(children) = dependents.get(&key) {
                for child in children {
                    let degree = in_degree.get_mut(child).expect("child is a known node");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(*child);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(BuildError::GraphCycle);
        }
        Ok(order)
    }
}

/// What the caller needs out of the build
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOutputOptions {
    /// Keep streaming mip payloads resident in the returned record
    pub load_streaming_mips: bool,
    /// Emit the unencoded preview copy values
    pub cpu_copy: bool,
    /// Append detile/decode nodes for CPU-readable output
    pub needs_cpu_access: bool,
}

/// Node keys of the standard texture chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureGraphKeys {
    pub base: NodeKey,
    pub tiling: Option<NodeKey>,
    pub detile: Option<NodeKey>,
    pub decode: Option<NodeKey>,
}

/// Parent output values piped into every child of the chain: shape and
/// metadata, the packed mip tail, each streaming mip, and the CPU-copy
/// passthrough.
fn add_parent_outputs_as_inputs(
    inputs: &mut Vec<BuildInput>,
    parent: NodeKey,
    num_mips: u32,
    num_streaming: u32,
) {
    let mut push = |value: ValueId| {
        inputs.push(BuildInput {
            name: value.name(),
            source: InputSource::NodeValue {
                node: parent,
                value,
            },
        });
    };
    push(ValueId::Description);
    push(ValueId::ExtendedData);
    if num_mips > num_streaming {
        push(ValueId::MipTail);
    }
    for mip in 0..num_streaming {
        push(ValueId::Mip(mip as u8));
    }
    push(ValueId::CpuCopyImageInfo);
    push(ValueId::CpuCopyRawData);
}

fn serialize_engine_parameters(params: &TextureEngineParameters) -> Vec<u8> {
    let mut writer = KeyWriter::new();
    writer.write_u32(params.num_inline_mips);
    writer.write_bool(params.volume_streaming);
    writer.write_bool(params.array_streaming);
    writer.finish()
}

/// The policy of a base node: non-streaming outputs are always fully
/// cached; streaming mips are existence-only unless the caller wants
/// them resident.
pub fn base_node_policy(load_streaming_mips: bool) -> BuildCachePolicy {
    if load_streaming_mips {
        BuildCachePolicy::new(CachePolicy::DEFAULT)
    } else {
        let mut policy = BuildCachePolicy::new(CachePolicy::DEFAULT | CachePolicy::SKIP_DATA);
        for value in [
            ValueId::Description,
            ValueId::ExtendedData,
            ValueId::MipTail,
            ValueId::VirtualTextureLayout,
            ValueId::CpuCopyImageInfo,
            ValueId::CpuCopyRawData,
        ] {
            policy = policy.with_value_policy(value, CachePolicy::DEFAULT);
        }
        policy
    }
}

/// Construct the standard texture build chain: a base (linear or VT)
/// node, then a tiling node when the target format requires platform
/// tiling, then detile/decode nodes when the caller needs CPU-readable
/// output.
pub fn build_texture_graph(
    settings_per_layer: &[BuildSettings],
    source_id: ContentHash,
    composite_id: Option<ContentHash>,
    source_top: (u32, u32),
    engine: &TextureEngineParameters,
    options: &BuildOutputOptions,
) -> (BuildGraph, TextureGraphKeys) {
    let mut graph = BuildGraph::new();
    let base_settings = &settings_per_layer[0];

    let mut base_inputs = vec![BuildInput {
        name: "Source".to_string(),
        source: InputSource::Bulk(source_id),
    }];
    if let Some(composite_id) = composite_id {
        base_inputs.push(BuildInput {
            name: "CompositeSource".to_string(),
            source: InputSource::Bulk(composite_id),
        });
    }

    let base_function = if base_settings.virtual_streamable {
        BuildFunction::VirtualTexture
    } else {
        BuildFunction::LinearTexture
    };
    let base = graph.add(BuildNode {
        definition: BuildDefinition {
            function: base_function,
            constants: vec![
                (
                    "Settings".to_string(),
                    compute_settings_suffix(settings_per_layer),
                ),
                (
                    "EngineParameters".to_string(),
                    serialize_engine_parameters(engine),
                ),
            ],
            inputs: base_inputs,
        },
        policy: base_node_policy(options.load_streaming_mips),
        fallback: None,
    });

    // The VT path produces chunked output; the platform chain only
    // applies to the linear path.
    let tiler = if base_settings.virtual_streamable {
        None
    } else {
        base_settings.tiler.clone()
    };

    let num_mips = resolved_mip_count(base_settings, source_top.0, source_top.1);
    let mut keys = TextureGraphKeys {
        base,
        tiling: None,
        detile: None,
        decode: None,
    };

    if let Some(tiler_name) = tiler {
        let num_streaming = {
            // At definition time the tail is unknown; declare inputs for
            // every mip the engine could stream and let the parent emit
            // empty values for mips folded into its tail.
            let description = crate::description::EncodedTextureDescription::new_2d(
                source_top.0.max(1),
                source_top.1.max(1),
                num_mips,
                tephra_core::TextureFormat::Uncompressed(tephra_core::RawFormat::Bgra8),
            );
            crate::settings::num_streaming_mips(&description, None, engine)
        };

        let mut tiling_inputs = Vec::new();
        add_parent_outputs_as_inputs(&mut tiling_inputs, base, num_mips, num_streaming);
        let mut lod_bias = KeyWriter::new();
        lod_bias.write_i32(base_settings.lod_bias);
        let tiling = graph.add(BuildNode {
            definition: BuildDefinition {
                function: BuildFunction::Tile {
                    tiler: tiler_name.clone(),
                },
                constants: vec![("LODBias".to_string(), lod_bias.finish())],
                inputs: tiling_inputs,
            },
            policy: base_node_policy(options.load_streaming_mips),
            fallback: None,
        });
        keys.tiling = Some(tiling);

        if options.needs_cpu_access {
            let mut detile_inputs = Vec::new();
            add_parent_outputs_as_inputs(&mut detile_inputs, tiling, num_mips, num_streaming);
            let detile = graph.add(BuildNode {
                definition: BuildDefinition {
                    function: BuildFunction::Detile { tiler: tiler_name },
                    constants: Vec::new(),
                    inputs: detile_inputs,
                },
                policy: BuildCachePolicy::new(CachePolicy::DEFAULT),
                // A failed detile falls back to the tiled result for
                // metadata purposes
                fallback: Some(tiling),
            });
            keys.detile = Some(detile);
        }
    }

    if options.needs_cpu_access {
        let parent = keys.detile.or(keys.tiling).unwrap_or(keys.base);
        let mut decode_inputs = Vec::new();
        add_parent_outputs_as_inputs(&mut decode_inputs, parent, num_mips, 0);
        let mut info = KeyWriter::new();
        info.write_opt_str(
            base_settings
                .base_format_name
                .as_ref()
                .map(|n| n.as_str()),
        );
        info.write_i32(base_settings.lod_bias);
        let decode = graph.add(BuildNode {
            definition: BuildDefinition {
                function: BuildFunction::Decode,
                constants: vec![("TextureInfo".to_string(), info.finish())],
                inputs: decode_inputs,
            },
            policy: BuildCachePolicy::new(CachePolicy::DEFAULT),
            fallback: Some(parent),
        });
        keys.decode = Some(decode);
    }

    (graph, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::FormatName;

    fn settings(tiler: Option<&str>, vt: bool) -> Vec<BuildSettings> {
        vec![BuildSettings {
            format_name: Some(FormatName::from("BGRA8")),
            base_format_name: Some(FormatName::from("BGRA8")),
            tiler: tiler.map(str::to_string),
            virtual_streamable: vt,
            ..Default::default()
        }]
    }

    fn graph_for(
        tiler: Option<&str>,
        vt: bool,
        options: BuildOutputOptions,
    ) -> (BuildGraph, TextureGraphKeys) {
        build_texture_graph(
            &settings(tiler, vt),
            ContentHash::of(b"source"),
            None,
            (256, 256),
            &TextureEngineParameters::default(),
            &options,
        )
    }

    #[test]
    fn test_base_only_graph() {
        let (graph, keys) = graph_for(None, false, BuildOutputOptions::default());
        assert_eq!(graph.len(), 1);
        assert_eq!(keys.tiling, None);
        assert_eq!(graph.topological_order().unwrap(), vec![keys.base]);
    }

    #[test]
    fn test_tiled_chain_topology() {
        let options = BuildOutputOptions {
            needs_cpu_access: true,
            ..Default::default()
        };
        let (graph, keys) = graph_for(Some("console"), false, options);
        assert_eq!(graph.len(), 4);

        let order = graph.topological_order().unwrap();
        let position = |key: &NodeKey| order.iter().position(|k| k == key).unwrap();
        assert!(position(&keys.base) < position(&keys.tiling.unwrap()));
        assert!(position(&keys.tiling.unwrap()) < position(&keys.detile.unwrap()));
        assert!(position(&keys.detile.unwrap()) < position(&keys.decode.unwrap()));
    }

    #[test]
    fn test_vt_graph_has_no_tiling_chain() {
        let (graph, keys) = graph_for(Some("console"), true, BuildOutputOptions::default());
        assert_eq!(graph.len(), 1);
        assert_eq!(keys.tiling, None);
    }

    #[test]
    fn test_child_inputs_reference_parent_values() {
        let (graph, keys) = graph_for(Some("console"), false, BuildOutputOptions::default());
        let tiling = graph.get(&keys.tiling.unwrap()).unwrap();
        for input in &tiling.definition.inputs {
            match &input.source {
                InputSource::NodeValue { node, value } => {
                    assert_eq!(*node, keys.base);
                    assert_eq!(input.name, value.name());
                }
                InputSource::Bulk(_) => panic!("tiling node must not read bulk data"),
            }
        }
        // Description, ExtendedData, MipTail, streaming mips, CPU pair
        assert!(tiling.definition.inputs.len() >= 5);
    }

    #[test]
    fn test_definition_key_tracks_contents() {
        let (_, a) = graph_for(None, false, BuildOutputOptions::default());
        let (_, b) = graph_for(None, false, BuildOutputOptions::default());
        assert_eq!(a.base, b.base);

        let (_, c) = graph_for(Some("console"), false, BuildOutputOptions::default());
        assert_eq!(a.base, c.base); // base definition unchanged by chain

        let changed = build_texture_graph(
            &settings(None, false),
            ContentHash::of(b"other-source"),
            None,
            (256, 256),
            &TextureEngineParameters::default(),
            &BuildOutputOptions::default(),
        );
        assert_ne!(a.base, changed.1.base);
    }

    #[test]
    fn test_dangling_parent_references_are_ignored() {
        let mut graph = BuildGraph::new();
        let key = graph.add(BuildNode {
            definition: BuildDefinition {
                function: BuildFunction::LinearTexture,
                constants: Vec::new(),
                inputs: vec![BuildInput {
                    name: "orphan".to_string(),
                    source: InputSource::NodeValue {
                        node: ContentHash::of(b"not in this graph"),
                        value: ValueId::Description,
                    },
                }],
            },
            policy: BuildCachePolicy::default(),
            fallback: None,
        });
        assert_eq!(graph.topological_order().unwrap(), vec![key]);
    }
}
