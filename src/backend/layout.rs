// Image layout transitions
//
// Every transition the renderer performs is listed in TRANSITIONS. Asking
// for a pair that is not listed is an error, not a best-effort barrier.

use ash::vk;

use super::image::aspect_mask;
use crate::error::RendererError;

/// Synchronization scopes for one (old, new) layout pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionScopes {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

struct TransitionRule {
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    scopes: TransitionScopes,
}

const DEPTH_ATTACHMENT_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
);

static TRANSITIONS: [TransitionRule; 3] = [
    // Fresh image about to receive a staging copy
    TransitionRule {
        old: vk::ImageLayout::UNDEFINED,
        new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        scopes: TransitionScopes {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
    },
    // Copied texture handed to fragment shaders
    TransitionRule {
        old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        scopes: TransitionScopes {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
    },
    // Depth buffer before its first render pass
    TransitionRule {
        old: vk::ImageLayout::UNDEFINED,
        new: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        scopes: TransitionScopes {
            src_access: vk::AccessFlags::empty(),
            dst_access: DEPTH_ATTACHMENT_ACCESS,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        },
    },
];

pub fn transition_scopes(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionScopes, RendererError> {
    TRANSITIONS
        .iter()
        .find(|rule| rule.old == old && rule.new == new)
        .map(|rule| rule.scopes)
        .ok_or(RendererError::UnsupportedLayoutTransition { old, new })
}

/// Record a pipeline barrier moving every mip of `image` from `old` to `new`.
pub fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<(), RendererError> {
    let scopes = transition_scopes(old, new)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(format),
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(scopes.src_access)
        .dst_access_mask(scopes.dst_access)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            scopes.src_stage,
            scopes.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transitions() {
        let to_dst = transition_scopes(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = transition_scopes(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_read.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn depth_transition() {
        let scopes = transition_scopes(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(
            scopes.dst_access,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
        assert_eq!(scopes.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn unlisted_pair_is_rejected() {
        let err = transition_scopes(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RendererError::UnsupportedLayoutTransition {
                old: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            }
        ));

        // Direction matters
        assert!(transition_scopes(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::UNDEFINED
        )
        .is_err());
    }
}
