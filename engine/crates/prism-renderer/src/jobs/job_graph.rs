//! 每帧从脏标记构建的 job 依赖图
//!
//! job 存放在 arena 中，依赖只能指向之前加入的 job，因此 arena 的顺序本身就是一个合法的执行顺序；
//! 构建完成后仍然用 petgraph 做一次拓扑排序作为校验。

use itertools::Itertools;
use petgraph::{
    Direction,
    algo::toposort,
    graph::{DiGraph, NodeIndex},
};
use prism_scene::{
    camera::CameraManager, dirty::DirtySet, scene_manager::SceneManager, settings::RenderSettings,
};

use super::job::{JobContext, JobError, JobKind, MaterialTarget};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(usize);

impl JobHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct JobNode {
    pub kind: JobKind,
    pub dependencies: Vec<JobHandle>,
}

#[derive(Debug, Default)]
pub struct JobGraph {
    jobs: Vec<JobNode>,
}

/// 一次 [`JobGraph::run_all`] 的结果
#[derive(Debug, Default)]
pub struct JobReport {
    pub completed: Vec<JobHandle>,
    pub failed: Vec<(JobHandle, JobError)>,
    /// 因为依赖失败而没有执行的 job
    pub skipped: Vec<JobHandle>,
}

impl JobReport {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn tlas_failed(&self) -> bool {
        self.failed.iter().any(|(_, err)| matches!(err, JobError::Tlas(_)))
    }
}

// new & init
impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一个 job，依赖必须是已经加入的 job，重复的依赖只保留一次
    pub fn add_job(&mut self, kind: JobKind, dependencies: &[JobHandle]) -> JobHandle {
        let handle = JobHandle(self.jobs.len());
        debug_assert!(dependencies.iter().all(|dep| dep.0 < handle.0), "job depends on a later job");
        let dependencies = dependencies.iter().copied().filter(|dep| dep.0 < handle.0).unique().collect();
        self.jobs.push(JobNode { kind, dependencies });
        handle
    }
}

// getters
impl JobGraph {
    #[inline]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    #[inline]
    pub fn job(&self, handle: JobHandle) -> &JobNode {
        &self.jobs[handle.0]
    }

    pub fn handles(&self) -> impl Iterator<Item = JobHandle> + '_ {
        (0..self.jobs.len()).map(JobHandle)
    }

    pub fn find(&self, pred: impl Fn(&JobKind) -> bool) -> Vec<JobHandle> {
        self.jobs.iter().enumerate().filter(|(_, job)| pred(&job.kind)).map(|(i, _)| JobHandle(i)).collect()
    }

    pub fn count(&self, pred: impl Fn(&JobKind) -> bool) -> usize {
        self.jobs.iter().filter(|job| pred(&job.kind)).count()
    }
}

// tools
impl JobGraph {
    fn to_petgraph(&self) -> DiGraph<usize, ()> {
        let mut graph = DiGraph::with_capacity(self.jobs.len(), self.jobs.len() * 2);
        let nodes: Vec<NodeIndex> = (0..self.jobs.len()).map(|i| graph.add_node(i)).collect();
        for (i, job) in self.jobs.iter().enumerate() {
            for dep in &job.dependencies {
                graph.add_edge(nodes[dep.0], nodes[i], ());
            }
        }
        graph
    }

    /// 拓扑排序
    ///
    /// # 返回
    /// - `Ok(order)`: 执行顺序
    /// - `Err(job)`: 检测到循环依赖，返回循环中的一个 job
    pub fn topological_sort(&self) -> Result<Vec<JobHandle>, JobHandle> {
        let graph = self.to_petgraph();
        match toposort(&graph, None) {
            Ok(sorted) => Ok(sorted.into_iter().map(|n| JobHandle(graph[n])).collect()),
            Err(cycle) => Err(JobHandle(graph[cycle.node_id()])),
        }
    }

    /// 直接依赖于 `handle` 的 job
    pub fn dependents(&self, handle: JobHandle) -> Vec<JobHandle> {
        let graph = self.to_petgraph();
        graph
            .neighbors_directed(NodeIndex::new(handle.0), Direction::Outgoing)
            .map(|n| JobHandle(graph[n]))
            .sorted()
            .collect()
    }
}

// update
impl JobGraph {
    /// 在当前线程中按依赖顺序执行全部 job
    ///
    /// 某个 job 失败后，所有直接或间接依赖它的 job 都会被跳过，其余 job 照常执行。
    pub fn run_all(&self, ctx: &mut JobContext) -> JobReport {
        let _span = tracy_client::span!("JobGraph::run_all");

        let mut report = JobReport::default();
        if let Err(job) = self.topological_sort() {
            log::error!("job graph has a cycle at {}, nothing executed", self.job(job).kind.name());
            report.skipped = self.handles().collect();
            return report;
        }

        let mut blocked = vec![false; self.jobs.len()];
        for (i, job) in self.jobs.iter().enumerate() {
            let handle = JobHandle(i);
            if job.dependencies.iter().any(|dep| blocked[dep.0]) {
                log::debug!("job {} skipped, a dependency failed", job.kind.name());
                blocked[i] = true;
                report.skipped.push(handle);
                continue;
            }

            match job.kind.run(ctx) {
                Ok(()) => report.completed.push(handle),
                Err(err) if err.is_ignorable() => {
                    log::debug!("job {}: {}", job.kind.name(), err);
                    report.completed.push(handle);
                }
                Err(err) => {
                    log::error!("job {} failed: {}", job.kind.name(), err);
                    blocked[i] = true;
                    report.failed.push((handle, err));
                }
            }
        }
        report
    }
}

/// 根据脏标记构建这一帧的 job graph
///
/// 需要同步完成的工作（重新收集可渲染实体、重新解析活动相机）在这里直接执行，
/// 其余的工作都变成 job。
pub fn build_frame_jobs(
    dirty: DirtySet,
    scene: &mut dyn SceneManager,
    camera: &mut CameraManager,
    settings: Option<&dyn RenderSettings>,
) -> JobGraph {
    let _span = tracy_client::span!("build_frame_jobs");

    let mut graph = JobGraph::new();
    graph.add_job(JobKind::ReclaimExpiredResources, &[]);
    if dirty.is_empty() {
        return graph;
    }

    let mut need_tlas = false;
    let mut need_instances = false;
    let mut need_emitters = false;
    let mut need_render_params = false;

    let mut regather = false;
    if dirty.intersects(DirtySet::ENTITY | DirtySet::GEOMETRY) {
        regather = true;
        need_tlas = true;
        need_instances = true;
        need_emitters = true;
    }
    if dirty.contains(DirtySet::LIGHT) {
        regather = true;
        need_emitters = true;
    }
    if regather {
        scene.gather_entities();
    }

    let transform_job = if dirty.contains(DirtySet::TRANSFORM) {
        need_tlas = true;
        need_instances = true;
        need_emitters = true;
        need_render_params = true;
        Some(graph.add_job(JobKind::UpdateTransforms, &[]))
    } else {
        None
    };

    let mut geometry_jobs = Vec::new();
    if dirty.contains(DirtySet::GEOMETRY) {
        need_tlas = true;
        need_instances = true;
        need_emitters = true;
        for id in scene.acquire_dirty_geometries() {
            match scene.lookup_geometry(id) {
                Some(geometry) => geometry_jobs.push(graph.add_job(JobKind::BuildGeometry(geometry), &[])),
                None => log::debug!("dirty geometry {:?} no longer exists", id),
            }
        }
    }

    let mut texture_jobs = Vec::new();
    let mut all_materials = false;
    if dirty.contains(DirtySet::TEXTURE) {
        need_emitters = true;
        all_materials = true;
        for id in scene.acquire_dirty_textures() {
            match scene.lookup_texture(id) {
                Some(texture) => texture_jobs.push(graph.add_job(JobKind::UploadTexture(texture), &[])),
                None => log::debug!("dirty texture {:?} no longer exists", id),
            }
        }
    }

    let mut material_job = None;
    if all_materials || dirty.contains(DirtySet::MATERIAL) {
        need_instances = true;
        need_emitters = true;
        let dirty_materials = scene.acquire_dirty_materials();
        let target = if all_materials {
            MaterialTarget::All(scene.active_materials())
        } else {
            MaterialTarget::Dirty(dirty_materials.into_iter().filter_map(|id| scene.lookup_material(id)).collect())
        };
        material_job = Some(graph.add_job(JobKind::UpdateMaterials(target), &texture_jobs));
    }

    if dirty.contains(DirtySet::CAMERA) {
        need_render_params = true;
        if camera.update_active_camera(settings, &*scene) {
            log::info!("active camera changed to {:?}", camera.active_camera());
        }
    }

    if scene.renderable_count() == 0 {
        need_tlas = false;
        need_instances = false;
        need_emitters = false;
    }

    if need_render_params {
        graph.add_job(JobKind::UpdateRenderParameters, transform_job.as_slice());
    }

    if need_tlas {
        let deps = transform_job.iter().chain(geometry_jobs.iter()).copied().collect_vec();
        graph.add_job(JobKind::BuildTlas, &deps);
    }

    if need_instances {
        let deps = transform_job.iter().chain(geometry_jobs.iter()).chain(material_job.iter()).copied().collect_vec();
        graph.add_job(JobKind::UpdateInstanceBuffer, &deps);
    }

    if need_emitters {
        let deps = transform_job
            .iter()
            .chain(geometry_jobs.iter())
            .chain(texture_jobs.iter())
            .chain(material_job.iter())
            .copied()
            .collect_vec();
        graph.add_job(JobKind::UpdateEmitters, &deps);
    }

    log::debug!("dirty {:?} -> {} jobs", dirty, graph.len());
    graph
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use glam::{Mat4, Vec3};
    use prism_gfx::null_device::NullDevice;
    use prism_scene::{
        ids::EntityId,
        memory_scene::{MaterialDesc, MemoryScene},
        params::CameraParameters,
        settings::StaticRenderSettings,
    };

    use super::*;
    use crate::{retired::RetiredResources, tlas::TlasBuilder};

    /// 一个 geometry、一个 texture、两个 material、两个可渲染实体、一个光源、一个相机
    fn demo_scene() -> MemoryScene {
        let mut scene = MemoryScene::new();
        scene.add_geometry(EntityId(1), 36, 36);
        scene.add_texture(EntityId(2), vk::Extent2D { width: 4, height: 4 });
        scene.add_material(
            EntityId(3),
            MaterialDesc {
                texture: Some(EntityId(2)),
                ..Default::default()
            },
        );
        scene.add_material(
            EntityId(4),
            MaterialDesc {
                emission: Vec3::ONE,
                ..Default::default()
            },
        );
        scene.add_renderable(EntityId(10), EntityId(1), EntityId(3), Mat4::IDENTITY);
        scene.add_renderable(EntityId(11), EntityId(1), EntityId(4), Mat4::from_translation(Vec3::X));
        scene.add_light(EntityId(20), Vec3::ONE, Mat4::IDENTITY);
        scene.add_camera(EntityId(30), CameraParameters::default());
        scene
    }

    fn build(dirty: DirtySet, scene: &mut MemoryScene) -> JobGraph {
        let mut camera = CameraManager::default();
        let settings = StaticRenderSettings {
            camera: Some(30),
            ..Default::default()
        };
        build_frame_jobs(dirty, scene, &mut camera, Some(&settings))
    }

    fn kinds(graph: &JobGraph) -> Vec<&'static str> {
        graph.handles().map(|h| graph.job(h).kind.name()).collect()
    }

    #[test]
    fn every_dirty_combination_is_acyclic() {
        for bits in 0..=DirtySet::all().bits() {
            let dirty = DirtySet::from_bits_truncate(bits);
            let mut scene = demo_scene();
            let graph = build(dirty, &mut scene);

            let order = graph.topological_sort().unwrap();
            assert_eq!(order.len(), graph.len());
            for handle in graph.handles() {
                let deps = &graph.job(handle).dependencies;
                assert!(deps.iter().all(|dep| *dep < handle), "{:?}: forward dependency", dirty);
                assert_eq!(deps.iter().unique().count(), deps.len(), "{:?}: duplicated dependency", dirty);
            }
            assert_eq!(graph.count(|k| *k == JobKind::ReclaimExpiredResources), 1);
            assert!(graph.count(|k| matches!(k, JobKind::UpdateMaterials(_))) <= 1);
        }
    }

    #[test]
    fn clean_frame_only_reclaims() {
        let mut scene = demo_scene();
        let graph = build(DirtySet::NONE, &mut scene);
        assert_eq!(kinds(&graph), ["reclaim-expired-resources"]);
        // 没有收集可渲染实体
        assert_eq!(scene.renderable_count(), 0);
    }

    #[test]
    fn texture_change_rebuilds_all_materials() {
        let mut scene = demo_scene();
        let graph = build(DirtySet::TEXTURE, &mut scene);

        let material_jobs = graph.find(|k| matches!(k, JobKind::UpdateMaterials(_)));
        assert_eq!(material_jobs.len(), 1);
        let JobKind::UpdateMaterials(target) = &graph.job(material_jobs[0]).kind else {
            unreachable!()
        };
        assert!(target.is_all());
        assert_eq!(target.materials().len(), scene.material_count());

        let texture_jobs = graph.find(|k| matches!(k, JobKind::UploadTexture(_)));
        assert_eq!(texture_jobs.len(), 1);
        assert_eq!(graph.job(material_jobs[0]).dependencies, texture_jobs);
        // 被强制更新后脏 material 列表已经清空
        assert!(scene.acquire_dirty_materials().is_empty());
    }

    #[test]
    fn material_change_targets_dirty_materials() {
        let mut scene = demo_scene();
        scene.acquire_dirty_materials();
        scene.add_material(EntityId(4), MaterialDesc::default());

        let graph = build(DirtySet::MATERIAL, &mut scene);
        let jobs = graph.find(|k| matches!(k, JobKind::UpdateMaterials(_)));
        let JobKind::UpdateMaterials(target) = &graph.job(jobs[0]).kind else {
            unreachable!()
        };
        assert!(!target.is_all());
        assert_eq!(target.materials(), [scene.lookup_material(EntityId(4)).unwrap()]);
    }

    #[test]
    fn stale_geometries_are_dropped() {
        let mut scene = demo_scene();
        scene.add_geometry(EntityId(5), 3, 3);
        scene.remove_geometry(EntityId(5));

        let graph = build(DirtySet::GEOMETRY, &mut scene);
        assert_eq!(graph.count(|k| matches!(k, JobKind::BuildGeometry(_))), 1);
    }

    #[test]
    fn tlas_waits_for_transforms_and_geometry() {
        let mut scene = demo_scene();
        let graph = build(DirtySet::TRANSFORM | DirtySet::GEOMETRY | DirtySet::ENTITY, &mut scene);

        let transform = graph.find(|k| *k == JobKind::UpdateTransforms);
        let geometry = graph.find(|k| matches!(k, JobKind::BuildGeometry(_)));
        let tlas = graph.find(|k| *k == JobKind::BuildTlas);
        assert_eq!(tlas.len(), 1);

        let expected = transform.iter().chain(geometry.iter()).copied().collect_vec();
        assert_eq!(graph.job(tlas[0]).dependencies, expected);
        assert!(graph.dependents(transform[0]).contains(&tlas[0]));

        let params = graph.find(|k| *k == JobKind::UpdateRenderParameters);
        assert_eq!(graph.job(params[0]).dependencies, transform);
    }

    #[test]
    fn empty_scene_skips_scene_buffers() {
        let mut scene = MemoryScene::new();
        let graph = build(DirtySet::ENTITY | DirtySet::TRANSFORM, &mut scene);
        assert_eq!(graph.count(|k| *k == JobKind::BuildTlas), 0);
        assert_eq!(graph.count(|k| *k == JobKind::UpdateInstanceBuffer), 0);
        assert_eq!(graph.count(|k| *k == JobKind::UpdateEmitters), 0);
        assert_eq!(graph.count(|k| *k == JobKind::UpdateTransforms), 1);
    }

    #[test]
    fn run_all_makes_scene_ready() {
        let device = NullDevice::new();
        let mut scene = demo_scene();
        let mut camera = CameraManager::default();
        let mut tlas_builder = TlasBuilder::default();
        let mut retired = RetiredResources::new(3);

        let graph = build(DirtySet::all(), &mut scene);
        let report = graph.run_all(&mut JobContext {
            device: &device,
            scene: &mut scene,
            camera: &mut camera,
            tlas_builder: &mut tlas_builder,
            retired: &mut retired,
            frame_id: 0,
        });

        assert!(report.is_success());
        assert_eq!(report.completed.len(), graph.len());
        assert!(scene.is_ready_to_render());
        assert_eq!(scene.num_emitters(), 2);
    }

    #[test]
    fn failed_job_skips_dependents() {
        let device = NullDevice::new();
        device.inject_failure(prism_gfx::null_device::NullFailure::CreateBuffer, 1);
        let mut scene = demo_scene();
        let mut camera = CameraManager::default();
        let mut tlas_builder = TlasBuilder::default();
        let mut retired = RetiredResources::new(3);

        let graph = build(DirtySet::GEOMETRY, &mut scene);
        let report = graph.run_all(&mut JobContext {
            device: &device,
            scene: &mut scene,
            camera: &mut camera,
            tlas_builder: &mut tlas_builder,
            retired: &mut retired,
            frame_id: 0,
        });

        // geometry 失败，TLAS、instance、emitter 都依赖它
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped.len(), 3);
        assert!(!report.tlas_failed());
        assert!(scene.scene_tlas().is_none());

        // 未完成的 job 把 geometry 放回脏列表
        let retry = report
            .failed
            .iter()
            .map(|(handle, _)| *handle)
            .chain(report.skipped.iter().copied())
            .fold(DirtySet::NONE, |dirty, handle| dirty | graph.job(handle).kind.requeue(&mut scene));
        assert_eq!(retry, DirtySet::GEOMETRY | DirtySet::ENTITY | DirtySet::LIGHT);
        assert_eq!(scene.acquire_dirty_geometries(), vec![EntityId(1)]);
    }
}
