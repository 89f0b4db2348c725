//! Build Orchestrator
//!
//! Owns the fetch-first / fetch-or-build cache policy, constructs the
//! build graph, and drives query + build execution. Construction and
//! cache queries run synchronously; the actual build can be handed to
//! the job system, which acts as the request owner with blocking wait,
//! cancellation, and priority adjustment.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use tephra_cache::{
    BuildCachePolicy, CacheKey, CachePolicy, CacheRecord, CacheStore, ContentHash, ValueId,
};
use tephra_core::{CancellationToken, ImageInfo, JobHandle, JobPriority, JobSystem, RawImage};

use crate::description::{EncodedTextureDescription, EncodedTextureExtendedData};
use crate::encoder::EncoderRegistry;
use crate::error::{BuildError, BuildResult};
use crate::graph::{
    build_texture_graph, BuildFunction, BuildGraph, BuildNode, BuildOutputOptions, InputSource,
    NodeKey, TextureGraphKeys,
};
use crate::key::StructuredKey;
use crate::memory::{estimate_physical_build, estimate_virtual_texture_build, MemoryEstimate};
use crate::settings::{
    num_streaming_mips, CompositeTextureMode, SettingsPerLayer, TextureEngineParameters,
};
use crate::source::TextureSource;
use crate::virtual_texture::VirtualTextureTileBuilder;

/// States one build request moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    QueryingFetchFirst,
    QueryingFetchOrBuild,
    Building,
    Storing,
    Done,
    Failed,
}

/// One texture build request
pub struct BuildRequest {
    pub texture_name: String,
    pub source: TextureSource,
    pub composite: Option<TextureSource>,
    /// Optional higher-quality settings variant queried opportunistically
    /// before the guaranteed-buildable variant. A miss here is not an
    /// error.
    pub settings_fetch_first: Option<SettingsPerLayer>,
    /// The variant that is built when everything misses
    pub settings_fetch_or_build: SettingsPerLayer,
    pub options: BuildOutputOptions,
    /// Bypass the cache query entirely and overwrite the prior entry
    pub force_rebuild: bool,
    pub priority: JobPriority,
}

/// Result of a completed build request
#[derive(Debug)]
pub struct BuildOutcome {
    pub key: CacheKey,
    pub record: CacheRecord,
    pub description: EncodedTextureDescription,
    pub cache_hit: bool,
    pub used_fetch_first: bool,
    pub memory_estimate: MemoryEstimate,
    /// State transitions, in order
    pub states: Vec<BuildState>,
    /// Errors from nodes whose fallback result was substituted
    pub node_errors: Vec<String>,
}

/// Handle to an in-flight build: blocking wait, cancellation, priority
pub struct BuildRequestHandle {
    handle: JobHandle,
    token: CancellationToken,
    result: Arc<Mutex<Option<BuildResult<BuildOutcome>>>>,
}

impl BuildRequestHandle {
    /// Block until the build finishes and take its outcome
    pub fn wait(self) -> BuildResult<BuildOutcome> {
        self.handle.wait();
        self.result
            .lock()
            .take()
            .unwrap_or(Err(BuildError::Cancelled))
    }

    pub fn is_complete(&self) -> bool {
        self.handle.is_complete()
    }

    /// Request cooperative cancellation; the build unwinds at the next
    /// tile, mip, or node boundary without a partial cache write.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn set_priority(&self, priority: JobPriority) {
        self.handle.set_priority(priority);
    }
}

/// Drives texture builds against a cache store and encoder registry
#[derive(Clone)]
pub struct BuildOrchestrator {
    registry: Arc<EncoderRegistry>,
    store: Arc<dyn CacheStore>,
    engine: TextureEngineParameters,
}

impl BuildOrchestrator {
    pub fn new(
        registry: Arc<EncoderRegistry>,
        store: Arc<dyn CacheStore>,
        engine: TextureEngineParameters,
    ) -> Self {
        Self {
            registry,
            store,
            engine,
        }
    }

    /// Hand the request to the job system and return the request owner
    pub fn submit(&self, jobs: &JobSystem, request: BuildRequest) -> BuildRequestHandle {
        let token = CancellationToken::new();
        let result = Arc::new(Mutex::new(None));
        let orchestrator = self.clone();
        let job_token = token.clone();
        let job_result = result.clone();
        let priority = request.priority;

        let handle = jobs.submit(priority, move || {
            let outcome = orchestrator.build_blocking(request, &job_token);
            *job_result.lock() = Some(outcome);
        });

        BuildRequestHandle {
            handle,
            token,
            result,
        }
    }

    /// Run the full state machine on the calling thread
    pub fn build_blocking(
        &self,
        request: BuildRequest,
        token: &CancellationToken,
    ) -> BuildResult<BuildOutcome> {
        let mut states = vec![BuildState::Idle];
        let fob = &request.settings_fetch_or_build;
        if fob.is_empty() || !fob[0].can_build() {
            states.push(BuildState::Failed);
            return Err(BuildError::FormatUnresolved {
                texture: request.texture_name.clone(),
            });
        }

        let memory_estimate = if fob[0].virtual_streamable {
            estimate_virtual_texture_build(fob, &request.source, rayon::current_num_threads())
        } else {
            estimate_physical_build(fob, &request.source)
        };

        let source_id = request.source.content_id();
        let composite_id = match (&request.composite, fob[0].composite_mode) {
            (Some(composite), CompositeTextureMode::RoughnessToAlpha) => {
                Some(composite.content_id())
            }
            _ => None,
        };
        let top = request.source.top_dimensions();

        let (graph, keys) =
            build_texture_graph(fob, source_id, composite_id, top, &self.engine, &request.options);
        let fob_key = structured_key(&keys, source_id, composite_id).compute();

        if !request.force_rebuild {
            // Fetch-first: opportunistic query of the higher-quality
            // variant. Misses fall through silently.
            if let Some(ff) = &request.settings_fetch_first {
                if !ff.is_empty() && ff[0].can_build() {
                    let (_, ff_keys) = build_texture_graph(
                        ff,
                        source_id,
                        composite_id,
                        top,
                        &self.engine,
                        &request.options,
                    );
                    let ff_key = structured_key(&ff_keys, source_id, composite_id).compute();
                    if ff_key != fob_key {
                        states.push(BuildState::QueryingFetchFirst);
                        if let Some((record, description)) = self.try_fetch(&ff_key, &request) {
                            states.push(BuildState::Done);
                            return Ok(BuildOutcome {
                                key: ff_key,
                                record,
                                description,
                                cache_hit: true,
                                used_fetch_first: true,
                                memory_estimate,
                                states,
                                node_errors: Vec::new(),
                            });
                        }
                    }
                }
            }

            states.push(BuildState::QueryingFetchOrBuild);
            if let Some((record, description)) = self.try_fetch(&fob_key, &request) {
                states.push(BuildState::Done);
                return Ok(BuildOutcome {
                    key: fob_key,
                    record,
                    description,
                    cache_hit: true,
                    used_fetch_first: false,
                    memory_estimate,
                    states,
                    node_errors: Vec::new(),
                });
            }
        }

        states.push(BuildState::Building);
        let (record, description, node_errors) =
            match self.execute_graph(&graph, &keys, &request, token) {
                Ok(result) => result,
                Err(e) => {
                    states.push(BuildState::Failed);
                    return Err(e);
                }
            };

        states.push(BuildState::Storing);
        if token.is_cancelled() {
            // Cancelled builds leave no partially-written cache entry
            states.push(BuildState::Failed);
            return Err(BuildError::Cancelled);
        }
        if let Err(e) = self.store.put(&fob_key, &record, request.force_rebuild) {
            log::error!(
                "failed to store build of '{}' under {fob_key}: {e}",
                request.texture_name
            );
        }

        states.push(BuildState::Done);
        let record = strip_streaming_payloads(record, request.options.load_streaming_mips);
        Ok(BuildOutcome {
            key: fob_key,
            record,
            description,
            cache_hit: false,
            used_fetch_first: false,
            memory_estimate,
            states,
            node_errors,
        })
    }

    /// Query the store, degrading backend errors to misses
    fn try_fetch(
        &self,
        key: &CacheKey,
        request: &BuildRequest,
    ) -> Option<(CacheRecord, EncodedTextureDescription)> {
        let policy = fetch_policy(request.options.load_streaming_mips);
        let record = match self.store.get(key, &policy) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                log::warn!(
                    "cache query for '{}' failed ({e}), treating as miss",
                    request.texture_name
                );
                return None;
            }
        };
        let description = load_description(&record)?;
        Some((record, description))
    }

    fn execute_graph(
        &self,
        graph: &BuildGraph,
        keys: &TextureGraphKeys,
        request: &BuildRequest,
        token: &CancellationToken,
    ) -> BuildResult<(CacheRecord, EncodedTextureDescription, Vec<String>)> {
        let order = graph.topological_order()?;
        let mut outputs: AHashMap<NodeKey, (CacheRecord, EncodedTextureDescription)> =
            AHashMap::new();
        let mut node_errors = Vec::new();

        for key in order {
            if token.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let node = graph.get(&key).expect("order only contains graph nodes");

            // Per-node cache: a node whose policy allows querying can be
            // satisfied from the store without re-executing. Children
            // need every mip resident, so the node-level fetch never
            // skips data.
            let node_key = node_cache_key(&key);
            if !request.force_rebuild && node.policy.queries_cache() {
                let full = BuildCachePolicy::new(CachePolicy::QUERY);
                if let Ok(Some(record)) = self.store.get(&node_key, &full) {
                    if let Some(description) = load_description(&record) {
                        outputs.insert(key, (record, description));
                        continue;
                    }
                }
            }

            match self.execute_node(node, request, &outputs, token) {
                Ok(result) => {
                    if !token.is_cancelled()
                        && node.policy.base().contains(CachePolicy::STORE_ON_BUILD)
                    {
                        if let Err(e) =
                            self.store
                                .put(&node_key, &result.0, request.force_rebuild)
                        {
                            log::warn!("failed to store node output under {node_key}: {e}");
                        }
                    }
                    outputs.insert(key, result);
                }
                Err(e) => {
                    // A node with a fallback substitutes the fallback's
                    // result while the terminal error is still surfaced;
                    // without one, failure propagates to all dependents.
                    let fallback = node
                        .fallback
                        .as_ref()
                        .and_then(|f| outputs.get(f))
                        .cloned();
                    match fallback {
                        Some(result) => {
                            node_errors.push(format!(
                                "node '{}' failed, substituted fallback: {e}",
                                node.definition.function.name()
                            ));
                            outputs.insert(key, result);
                        }
                        None => return Err(e),
                    }
                }
            }
        }

        let terminal = keys
            .decode
            .or(keys.detile)
            .or(keys.tiling)
            .unwrap_or(keys.base);
        let (record, description) = outputs
            .remove(&terminal)
            .ok_or(BuildError::GraphCycle)?;
        Ok((record, description, node_errors))
    }

    fn execute_node(
        &self,
        node: &BuildNode,
        request: &BuildRequest,
        outputs: &AHashMap<NodeKey, (CacheRecord, EncodedTextureDescription)>,
        token: &CancellationToken,
    ) -> BuildResult<(CacheRecord, EncodedTextureDescription)> {
        match &node.definition.function {
            BuildFunction::LinearTexture => self.build_linear(request, token),
            BuildFunction::VirtualTexture => self.build_virtual(request, token),
            BuildFunction::Tile { tiler } => self.run_tiling(node, tiler, request, outputs),
            BuildFunction::Detile { tiler } => self.run_detile(node, tiler, request, outputs),
            BuildFunction::Decode => self.run_decode(node, request, outputs),
        }
    }

    fn build_linear(
        &self,
        request: &BuildRequest,
        token: &CancellationToken,
    ) -> BuildResult<(CacheRecord, EncodedTextureDescription)> {
        let settings = &request.settings_fetch_or_build[0];
        let format_name = settings
            .format_name
            .as_ref()
            .ok_or_else(|| BuildError::FormatUnresolved {
                texture: request.texture_name.clone(),
            })?;
        let encoder =
            self.registry
                .find_encoder(format_name)
                .ok_or_else(|| BuildError::Resolution {
                    texture: request.texture_name.clone(),
                    format: format_name.to_string(),
                })?;

        let source_image = &request.source.blocks[0].layers[0];
        let intermediate = encoder.intermediate_format(request.source.is_hdr(0));
        let mut top = apply_pow2(source_image.convert_to(intermediate), settings.pow2_mode);

        // Uniform downscale, rounded to whole halvings
        let downscale_steps = settings.downscale.max(1.0).log2().round() as u32;
        top = self.shrink_top(top, downscale_steps, &request.texture_name)?;

        // Resolution cap: pre-shrink the top mip so the chain starts at
        // the capped dimensions. Aspect is preserved by whole halvings.
        let (_capped_w, _capped_h, _, halvings) =
            settings.apply_resolution_cap(top.width(), top.height(), 1);
        top = self.shrink_top(top, halvings, &request.texture_name)?;
        debug_assert_eq!((top.width(), top.height()), (_capped_w, _capped_h));

        if token.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let num_mips = crate::settings::resolved_mip_count(settings, top.width(), top.height());
        let mut chain = self
            .registry
            .mip_filter()
            .generate_chain(&top, settings.mip_gen, num_mips)
            .map_err(|e| BuildError::Encoder {
                texture: request.texture_name.clone(),
                node: "LinearTexture".to_string(),
                message: e.to_string(),
            })?;

        if settings.composite_mode == CompositeTextureMode::RoughnessToAlpha {
            if let Some(composite) = &request.composite {
                let composite_top = composite.blocks[0].layers[0].convert_to(intermediate);
                let composite_chain = self
                    .registry
                    .mip_filter()
                    .generate_chain(
                        &composite_top,
                        crate::settings::MipGenMode::FromSource,
                        chain.len() as u32,
                    )
                    .map_err(|e| BuildError::Encoder {
                        texture: request.texture_name.clone(),
                        node: "LinearTexture".to_string(),
                        message: e.to_string(),
                    })?;
                crate::virtual_texture::apply_composite(
                    &mut chain,
                    &composite_chain,
                    settings.composite_power,
                );
            }
        }

        let mut encoded = Vec::with_capacity(chain.len());
        for mip in &chain {
            if token.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let bytes = encoder
                .encode_image(mip, settings)
                .map_err(|e| BuildError::Encoder {
                    texture: request.texture_name.clone(),
                    node: "LinearTexture".to_string(),
                    message: e.to_string(),
                })?;
            encoded.push(bytes);
        }

        let mut description =
            EncodedTextureDescription::new_2d(
                top.width(),
                top.height(),
                chain.len() as u32,
                encoder.encoded_format(settings),
            );
        description.cubemap = settings.cubemap;
        description.texture_array = settings.texture_array;
        description.volume = settings.volume;

        let extended = EncodedTextureExtendedData {
            num_mips_in_tail: 0,
            tiler_data: 0,
            mip_sizes_in_bytes: encoded.iter().map(|m| m.len() as u64).collect(),
        };

        let mut record = pack_mip_record(&description, &extended, encoded, &self.engine)?;
        if request.options.cpu_copy {
            let info: &ImageInfo = chain[0].info();
            record.insert_data(
                ValueId::CpuCopyImageInfo,
                bincode::serialize(info).map_err(serialization_error)?,
            );
            record.insert_data(ValueId::CpuCopyRawData, chain[0].data().to_vec());
        }
        Ok((record, description))
    }

    /// Downsample the top mip by whole halvings through the mip filter
    fn shrink_top(&self, top: RawImage, halvings: u32, texture: &str) -> BuildResult<RawImage> {
        if halvings == 0 {
            return Ok(top);
        }
        let chain = self
            .registry
            .mip_filter()
            .generate_chain(&top, crate::settings::MipGenMode::FromSource, halvings + 1)
            .map_err(|e| BuildError::Encoder {
                texture: texture.to_string(),
                node: "LinearTexture".to_string(),
                message: e.to_string(),
            })?;
        Ok(chain.into_iter().last().expect("chain is never empty"))
    }

    fn build_virtual(
        &self,
        request: &BuildRequest,
        token: &CancellationToken,
    ) -> BuildResult<(CacheRecord, EncodedTextureDescription)> {
        let builder = VirtualTextureTileBuilder::new(self.registry.as_ref());
        let composite = match request.settings_fetch_or_build[0].composite_mode {
            CompositeTextureMode::RoughnessToAlpha => request.composite.as_ref(),
            CompositeTextureMode::Disabled => None,
        };
        let output = builder.build(
            &request.source,
            composite,
            &request.settings_fetch_or_build,
            token,
        )?;

        let mut record = CacheRecord::new();
        record.insert_data(
            ValueId::Description,
            bincode::serialize(&output.description).map_err(serialization_error)?,
        );
        let extended = EncodedTextureExtendedData::linear_for(&output.description);
        record.insert_data(
            ValueId::ExtendedData,
            bincode::serialize(&extended).map_err(serialization_error)?,
        );
        record.insert_data(
            ValueId::VirtualTextureLayout,
            bincode::serialize(&output.layout).map_err(serialization_error)?,
        );
        for (index, chunk) in output.chunks.into_iter().enumerate() {
            record.insert_data(ValueId::Chunk(index as u16), chunk);
        }
        Ok((record, output.description))
    }

    fn parent_output<'a>(
        &self,
        node: &BuildNode,
        outputs: &'a AHashMap<NodeKey, (CacheRecord, EncodedTextureDescription)>,
    ) -> BuildResult<&'a (CacheRecord, EncodedTextureDescription)> {
        let parent = node
            .definition
            .inputs
            .iter()
            .find_map(|input| match &input.source {
                InputSource::NodeValue { node, .. } => Some(*node),
                InputSource::Bulk(_) => None,
            })
            .ok_or_else(|| BuildError::MissingInput {
                node: node.definition.function.name(),
                input: "parent".to_string(),
            })?;
        outputs
            .get(&parent)
            .ok_or_else(|| BuildError::MissingInput {
                node: node.definition.function.name(),
                input: "parent output".to_string(),
            })
    }

    fn run_tiling(
        &self,
        node: &BuildNode,
        tiler_name: &str,
        request: &BuildRequest,
        outputs: &AHashMap<NodeKey, (CacheRecord, EncodedTextureDescription)>,
    ) -> BuildResult<(CacheRecord, EncodedTextureDescription)> {
        let tiler = self
            .registry
            .find_tiler(tiler_name)
            .ok_or_else(|| BuildError::Resolution {
                texture: request.texture_name.clone(),
                format: tiler_name.to_string(),
            })?;
        let (parent_record, description) = self.parent_output(node, outputs)?;
        let linear_mips = collect_mips(parent_record, description, &node.definition.function)?;

        let lod_bias = request.settings_fetch_or_build[0].lod_bias.max(0) as u32;
        let mut extended = tiler.extended_data(description, lod_bias);
        let tiled = tiler
            .tile_mips(description, &linear_mips)
            .map_err(|e| BuildError::Encoder {
                texture: request.texture_name.clone(),
                node: node.definition.function.name(),
                message: e.to_string(),
            })?;
        extended.mip_sizes_in_bytes = tiled.iter().map(|m| m.len() as u64).collect();

        let mut record = pack_mip_record(description, &extended, tiled, &self.engine)?;
        copy_cpu_passthrough(parent_record, &mut record);
        Ok((record, description.clone()))
    }

    fn run_detile(
        &self,
        node: &BuildNode,
        tiler_name: &str,
        request: &BuildRequest,
        outputs: &AHashMap<NodeKey, (CacheRecord, EncodedTextureDescription)>,
    ) -> BuildResult<(CacheRecord, EncodedTextureDescription)> {
        let tiler = self
            .registry
            .find_tiler(tiler_name)
            .ok_or_else(|| BuildError::Resolution {
                texture: request.texture_name.clone(),
                format: tiler_name.to_string(),
            })?;
        let (parent_record, description) = self.parent_output(node, outputs)?;
        let tiled_mips = collect_mips(parent_record, description, &node.definition.function)?;
        let parent_extended = load_extended_data(parent_record)?;

        let linear = tiler
            .detile_mips(description, &parent_extended, &tiled_mips)
            .map_err(|e| BuildError::Encoder {
                texture: request.texture_name.clone(),
                node: node.definition.function.name(),
                message: e.to_string(),
            })?;

        let extended = EncodedTextureExtendedData {
            num_mips_in_tail: 0,
            tiler_data: 0,
            mip_sizes_in_bytes: linear.iter().map(|m| m.len() as u64).collect(),
        };
        let mut record = pack_mip_record(description, &extended, linear, &self.engine)?;
        copy_cpu_passthrough(parent_record, &mut record);
        Ok((record, description.clone()))
    }

    fn run_decode(
        &self,
        node: &BuildNode,
        request: &BuildRequest,
        outputs: &AHashMap<NodeKey, (CacheRecord, EncodedTextureDescription)>,
    ) -> BuildResult<(CacheRecord, EncodedTextureDescription)> {
        let settings = &request.settings_fetch_or_build[0];
        let format_name = settings
            .base_format_name
            .as_ref()
            .or(settings.format_name.as_ref())
            .ok_or_else(|| BuildError::FormatUnresolved {
                texture: request.texture_name.clone(),
            })?;
        let encoder =
            self.registry
                .find_encoder(format_name)
                .ok_or_else(|| BuildError::Resolution {
                    texture: request.texture_name.clone(),
                    format: format_name.to_string(),
                })?;

        let (parent_record, description) = self.parent_output(node, outputs)?;
        let encoded_mips = collect_mips(parent_record, description, &node.definition.function)?;

        let mut decoded = Vec::with_capacity(encoded_mips.len());
        let mut decoded_format = None;
        for (mip, bytes) in encoded_mips.iter().enumerate() {
            let (w, h, _) = description.mip_size(mip as u32);
            let info = ImageInfo {
                width: w,
                height: h,
                num_slices: description.num_slices_no_depth(),
                format: encoder.intermediate_format(false),
                gamma: settings.gamma,
            };
            let image = encoder
                .decode_image(bytes, info)
                .map_err(|e| BuildError::Encoder {
                    texture: request.texture_name.clone(),
                    node: node.definition.function.name(),
                    message: e.to_string(),
                })?;
            decoded_format = Some(image.format());
            decoded.push(image.into_data());
        }

        let mut description = description.clone();
        description.format = tephra_core::TextureFormat::Uncompressed(
            decoded_format.unwrap_or(encoder.intermediate_format(false)),
        );
        let extended = EncodedTextureExtendedData {
            num_mips_in_tail: 0,
            tiler_data: 0,
            mip_sizes_in_bytes: decoded.iter().map(|m| m.len() as u64).collect(),
        };
        let record = pack_mip_record(&description, &extended, decoded, &self.engine)?;
        Ok((record, description))
    }
}

fn node_cache_key(key: &NodeKey) -> CacheKey {
    CacheKey::namespaced("TEXTURE_NODE", key.as_bytes())
}

/// Power-of-two adjustment of the top mip for the linear path
fn apply_pow2(image: RawImage, mode: crate::settings::PowerOfTwoMode) -> RawImage {
    use crate::settings::PowerOfTwoMode;
    use tephra_core::image::round_up_pow2;

    let (w, h) = (image.width(), image.height());
    let (pw, ph) = (round_up_pow2(w), round_up_pow2(h));
    if (pw, ph) == (w, h) {
        return image;
    }
    match mode {
        PowerOfTwoMode::None => image,
        PowerOfTwoMode::StretchToPowerOfTwo => image.upscale_to(pw, ph),
        PowerOfTwoMode::PadToPowerOfTwo => {
            let mut canvas = RawImage::new_black(ImageInfo {
                width: pw,
                height: ph,
                ..*image.info()
            });
            for y in 0..h {
                for x in 0..w {
                    canvas.write_texel(x, y, 0, image.read_texel(x, y, 0));
                }
            }
            canvas
        }
    }
}

fn structured_key(
    keys: &TextureGraphKeys,
    source_id: ContentHash,
    composite_id: Option<ContentHash>,
) -> StructuredKey {
    StructuredKey {
        build_node: keys.base,
        tiling_node: keys.tiling,
        detile_node: keys.detile,
        decode_node: keys.decode,
        source_id,
        composite_id,
    }
}

/// Query policy: non-streaming values always come back resident;
/// streaming mips stay existence-only unless the caller wants them.
fn fetch_policy(load_streaming_mips: bool) -> BuildCachePolicy {
    crate::graph::base_node_policy(load_streaming_mips)
}

fn serialization_error(e: bincode::Error) -> BuildError {
    BuildError::Backend(tephra_cache::CacheError::Serialization(e.to_string()))
}

fn load_description(record: &CacheRecord) -> Option<EncodedTextureDescription> {
    let data = record.data(&ValueId::Description)?;
    bincode::deserialize(data).ok()
}

fn load_extended_data(record: &CacheRecord) -> BuildResult<EncodedTextureExtendedData> {
    let data = record
        .data(&ValueId::ExtendedData)
        .ok_or_else(|| BuildError::MissingInput {
            node: "child".to_string(),
            input: ValueId::ExtendedData.name(),
        })?;
    bincode::deserialize(data).map_err(serialization_error)
}

/// Pack per-mip payloads into a record: streaming mips as `Mip<N>`
/// values, the rest concatenated into `MipTail`, plus description and
/// extended data.
fn pack_mip_record(
    description: &EncodedTextureDescription,
    extended: &EncodedTextureExtendedData,
    mips: Vec<Vec<u8>>,
    engine: &TextureEngineParameters,
) -> BuildResult<CacheRecord> {
    let streaming = num_streaming_mips(description, Some(extended), engine) as usize;
    let mut record = CacheRecord::new();
    record.insert_data(
        ValueId::Description,
        bincode::serialize(description).map_err(serialization_error)?,
    );
    record.insert_data(
        ValueId::ExtendedData,
        bincode::serialize(extended).map_err(serialization_error)?,
    );

    let mut tail = Vec::new();
    for (index, payload) in mips.into_iter().enumerate() {
        if index < streaming {
            record.insert_data(ValueId::Mip(index as u8), payload);
        } else {
            tail.extend_from_slice(&payload);
        }
    }
    record.insert_data(ValueId::MipTail, tail);
    Ok(record)
}

/// Reassemble per-mip payloads from a record, splitting the mip tail by
/// the recorded per-mip sizes.
fn collect_mips(
    record: &CacheRecord,
    description: &EncodedTextureDescription,
    function: &BuildFunction,
) -> BuildResult<Vec<Vec<u8>>> {
    let extended = load_extended_data(record)?;
    let sizes = &extended.mip_sizes_in_bytes;
    let mut mips = Vec::with_capacity(description.num_mips as usize);

    let mut tail_cursor = 0usize;
    let tail = record.data(&ValueId::MipTail);
    for mip in 0..description.num_mips {
        if let Some(data) = record.data(&ValueId::Mip(mip as u8)) {
            mips.push(data.to_vec());
            continue;
        }
        let tail = tail.ok_or_else(|| BuildError::MissingInput {
            node: function.name(),
            input: ValueId::Mip(mip as u8).name(),
        })?;
        let size = *sizes
            .get(mip as usize)
            .ok_or_else(|| BuildError::MissingInput {
                node: function.name(),
                input: ValueId::ExtendedData.name(),
            })? as usize;
        let slice =
            tail.get(tail_cursor..tail_cursor + size)
                .ok_or_else(|| BuildError::MissingInput {
                    node: function.name(),
                    input: ValueId::MipTail.name(),
                })?;
        mips.push(slice.to_vec());
        tail_cursor += size;
    }
    Ok(mips)
}

/// CPU-copy values pass through child builds untouched
fn copy_cpu_passthrough(parent: &CacheRecord, child: &mut CacheRecord) {
    for value in [ValueId::CpuCopyImageInfo, ValueId::CpuCopyRawData] {
        if let Some(v) = parent.get(&value) {
            child.insert(value, v.clone());
        }
    }
}

/// Strip streaming mip payloads from the returned record when the
/// caller did not ask for them resident. The stored record keeps them.
fn strip_streaming_payloads(record: CacheRecord, load_streaming_mips: bool) -> CacheRecord {
    if load_streaming_mips {
        return record;
    }
    let mut out = CacheRecord::new();
    for (id, value) in record.iter() {
        if id.is_streaming_mip() {
            out.insert(*id, value.without_data());
        } else {
            out.insert(*id, value.clone());
        }
    }
    out
}
