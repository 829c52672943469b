// Mesh and texture loading
//
// Produces CPU-side data only. Uploading to the GPU is the renderer's job.
// The format is picked from the file extension: .obj goes through tobj,
// .gltf/.glb through gltf.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::mem::offset_of;
use std::path::Path;

use crate::error::RendererError;

const OBJ_VERTEX_COLOR: [f32; 3] = [1.0, 1.0, 1.0];
const GLTF_VERTEX_COLOR: [f32; 3] = [1.0, 0.0, 0.0];

/// Vertex layout consumed by mesh.vert (locations 0, 1, 2)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, tex_coord) as u32,
            },
        ]
    }
}

/// Loaded geometry. An empty index list means a non-indexed draw.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn is_indexed(&self) -> bool {
        !self.indices.is_empty()
    }
}

/// Decoded RGBA8 pixels, tightly packed
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

pub fn load_mesh(path: &Path) -> Result<MeshData> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let mesh = match extension.as_str() {
        "obj" => load_obj(path)?,
        "gltf" | "glb" => load_gltf(path)?,
        _ => {
            return Err(RendererError::UnsupportedMeshFormat {
                path: path.to_path_buf(),
                extension,
            }
            .into())
        }
    };

    let mesh = ensure_not_empty(path, mesh)?;
    log::info!(
        "Loaded mesh {} ({} vertices, {} indices)",
        path.display(),
        mesh.vertices.len(),
        mesh.indices.len()
    );
    Ok(mesh)
}

fn ensure_not_empty(path: &Path, mesh: MeshData) -> Result<MeshData, RendererError> {
    if mesh.vertices.is_empty() {
        return Err(RendererError::EmptyMesh(path.to_path_buf()));
    }
    Ok(mesh)
}

fn load_obj(path: &Path) -> Result<MeshData> {
    let options = tobj::LoadOptions {
        single_index: true,
        triangulate: true,
        ..Default::default()
    };
    let (models, _materials) = tobj::load_obj(path, &options)
        .with_context(|| format!("Failed to parse OBJ {}", path.display()))?;

    let mut mesh = MeshData::default();
    for model in &models {
        let source = &model.mesh;
        let base = draw_count(mesh.vertices.len(), "vertices")?;

        for (i, position) in source.positions.chunks_exact(3).enumerate() {
            // OBJ has V pointing up, Vulkan samples with V pointing down
            let tex_coord = source
                .texcoords
                .get(2 * i..2 * i + 2)
                .map(|uv| [uv[0], 1.0 - uv[1]])
                .unwrap_or([0.0, 0.0]);

            mesh.vertices.push(Vertex {
                position: [position[0], position[1], position[2]],
                color: OBJ_VERTEX_COLOR,
                tex_coord,
            });
        }
        mesh.indices.extend(source.indices.iter().map(|index| base + index));
    }

    Ok(mesh)
}

fn load_gltf(path: &Path) -> Result<MeshData> {
    let (document, buffers, _images) = gltf::import(path)
        .with_context(|| format!("Failed to import glTF {}", path.display()))?;

    let mut mesh = MeshData::default();
    // Primitives without indices get sequential ones once any primitive is indexed
    let mut unindexed_ranges = Vec::new();

    for primitive in document.meshes().flat_map(|m| m.primitives()) {
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));

        if primitive.mode() != gltf::mesh::Mode::Triangles {
            log::warn!(
                "Skipping glTF primitive with {:?} topology in {}",
                primitive.mode(),
                path.display()
            );
            continue;
        }

        let Some(positions) = reader.read_positions() else {
            log::warn!("Skipping glTF primitive without positions in {}", path.display());
            continue;
        };

        let base = draw_count(mesh.vertices.len(), "vertices")?;
        let mut tex_coords = reader.read_tex_coords(0).map(|coords| coords.into_f32());

        for position in positions {
            let tex_coord = tex_coords
                .as_mut()
                .and_then(|coords| coords.next())
                .unwrap_or([0.0, 0.0]);
            mesh.vertices.push(Vertex {
                position,
                color: GLTF_VERTEX_COLOR,
                tex_coord,
            });
        }

        let end = draw_count(mesh.vertices.len(), "vertices")?;
        match reader.read_indices() {
            Some(indices) => mesh
                .indices
                .extend(indices.into_u32().map(|index| base + index)),
            None => unindexed_ranges.push(base..end),
        }
    }

    if mesh.is_indexed() {
        for range in unindexed_ranges {
            mesh.indices.extend(range);
        }
    }

    Ok(mesh)
}

/// Vulkan draw and index counts are u32.
pub fn draw_count(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).with_context(|| format!("{} {} do not fit in one draw call", len, what))
}

pub fn load_texture(path: &Path) -> Result<TextureData> {
    let image = image::open(path)
        .with_context(|| format!("Failed to decode texture {}", path.display()))?
        .into_rgba8();

    let (width, height) = image.dimensions();
    log::info!("Loaded texture {} ({}x{})", path.display(), width, height);

    Ok(TextureData {
        width,
        height,
        pixels: image.into_raw(),
    })
}
