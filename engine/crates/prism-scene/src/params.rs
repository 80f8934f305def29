use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// 光追 pass 的 push constants
///
/// 每帧在录制前生成一次快照，之后不再修改
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RenderParameters {
    pub camera_to_world: Mat4,
    /// x: aspect ratio, y: tan(fov_y / 2), z: aperture, w: focal distance
    pub camera_lens: Vec4,

    pub num_primary_samples: u32,
    pub num_secondary_samples: u32,
    pub min_depth: u32,
    pub max_depth: u32,

    pub direct_radiance_clamp: f32,
    pub indirect_radiance_clamp: f32,
    /// 累积渲染的帧号，从 1 开始；重置累积后归零
    pub frame_number: u32,
    pub num_emitters: u32,
}

/// display pass 的 push constants
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DisplayParameters {
    pub exposure: f32,
    pub inv_gamma: f32,
}

impl Default for DisplayParameters {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            inv_gamma: 1.0 / 2.2,
        }
    }
}

/// 场景中相机节点的参数
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraParameters {
    pub camera_to_world: Mat4,
    pub aspect_ratio: f32,
    /// 竖直方向 fov，单位弧度
    pub fov_y: f32,
    pub aperture: f32,
    pub focal_distance: f32,
    pub exposure: f32,
    pub gamma: f32,
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self {
            camera_to_world: Mat4::IDENTITY,
            aspect_ratio: 16.0 / 9.0,
            fov_y: 60f32.to_radians(),
            aperture: 0.0,
            focal_distance: 1.0,
            exposure: 1.0,
            gamma: 2.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_parameters_layout() {
        // mat4 + vec4 + 8 个 32bit 标量
        assert_eq!(size_of::<RenderParameters>(), 64 + 16 + 32);
        let params = RenderParameters {
            frame_number: 7,
            ..Default::default()
        };
        let bytes = bytemuck::bytes_of(&params);
        let frame_number_offset = 64 + 16 + 24;
        assert_eq!(&bytes[frame_number_offset..frame_number_offset + 4], &7u32.to_ne_bytes());
    }
}
