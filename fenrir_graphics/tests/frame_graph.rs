//! End-to-end declare → record → frame runs over the headless backend.

use ash::vk;
use fenrir_graphics::{
    AddModelInfo, Command, CommandBufferCreateInfo, CommandType, ComputeBindingSet,
    ComputePassCreateInfo, HeadlessDevice, ImageLayout, LogSink, MeshBindings, Model, QueueId,
    RenderDevice, RenderPassCreateInfo, RendererCreateInfo, Scene, SceneCreateInfo,
    VertexBufferRef, VertexTemplate,
};

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1920,
    height: 1080,
};

struct SingleMesh(VertexBufferRef);

impl Model for SingleMesh {
    fn vertex_buffers(&self) -> Vec<VertexBufferRef> {
        vec![self.0]
    }
}

fn scene_over(image_count: usize, mirrors: bool) -> Scene<HeadlessDevice> {
    let _ = pretty_env_logger::try_init();
    let mut device = HeadlessDevice::new();
    let swap_chain_images = (0..image_count)
        .map(|_| device.register_image(EXTENT, vk::Format::B8G8R8A8_UNORM, vk::ImageLayout::UNDEFINED))
        .collect();
    let mirror_images = if mirrors {
        (0..image_count)
            .map(|_| {
                device.register_image(EXTENT, vk::Format::B8G8R8A8_UNORM, vk::ImageLayout::PRESENT_SRC_KHR)
            })
            .collect()
    } else {
        Vec::new()
    };
    Scene::new(
        device,
        SceneCreateInfo {
            swap_chain_images,
            swap_chain_command_type: CommandType::Graphics,
            mirror_images,
        },
        Box::new(LogSink),
    )
    .unwrap()
}

fn queues(scene: &mut Scene<HeadlessDevice>) -> (QueueId, QueueId) {
    let graphics = scene.device_mut().register_queue();
    let compute = scene.device_mut().register_queue();
    (graphics, compute)
}

#[test]
fn bare_mesh_records_draw_without_descriptor_bind() {
    let mut scene = scene_over(3, false);
    let pass = scene
        .add_render_pass(RenderPassCreateInfo {
            command_buffer: None,
            output_is_swap_chain: true,
            outputs: Vec::new(),
        })
        .unwrap();
    let renderer = scene
        .add_renderer(RendererCreateInfo {
            render_pass: pass,
            vertex_shader: "shaders/flat.vert.spv".into(),
            fragment_shader: Some("shaders/flat.frag.spv".into()),
            vertex_template: VertexTemplate::Position2d,
            ..RendererCreateInfo::default()
        })
        .unwrap();
    let model = {
        let device = scene.device_mut();
        SingleMesh(VertexBufferRef {
            vertex_buffer: device.register_buffer(),
            index_buffer: device.register_buffer(),
            index_count: 6,
        })
    };
    scene
        .add_model(AddModelInfo {
            model: &model,
            render_pass: pass,
            renderer,
            instance: None,
            bindings: MeshBindings::default(),
        })
        .unwrap();
    scene.record().unwrap();

    // One baked buffer per swapchain image.
    assert_eq!(scene.device().command_buffer_count(), 3);
    for cb in 0..3 {
        let commands = scene.device().commands(fenrir_graphics::CommandBufferId(cb));
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::DrawIndexed { index_count: 6, instance_count: 1 })));
        assert!(!commands
            .iter()
            .any(|c| matches!(c, Command::BindDescriptorSet { .. })));
        assert!(matches!(commands[0], Command::BeginRenderPass { .. }));
        assert!(matches!(commands.last(), Some(Command::EndRenderPass)));
    }

    // The swapchain pass renders depth-then-color with a present-ready
    // color attachment.
    let attachments = &scene.device().render_passes()[0];
    assert!(attachments[0].is_depth());
    assert_eq!(attachments[1].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
}

#[test]
fn sync_pair_waits_at_producer_declared_stage() {
    let mut scene = scene_over(2, false);
    let produce = scene
        .add_command_buffer(CommandBufferCreateInfo {
            command_type: CommandType::Compute,
            final_pipeline_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        })
        .unwrap();
    let consume = scene
        .add_command_buffer(CommandBufferCreateInfo {
            command_type: CommandType::Graphics,
            final_pipeline_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        })
        .unwrap();

    let target = scene.device_mut().register_image(
        EXTENT,
        vk::Format::R16G16B16A16_SFLOAT,
        vk::ImageLayout::GENERAL,
    );
    scene
        .add_compute_pass(ComputePassCreateInfo {
            command_buffer: Some(produce),
            output_is_swap_chain: false,
            output_binding: 0,
            extent: EXTENT,
            dispatch_groups: vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
            shader: "shaders/sim.comp.spv".into(),
            bindings: vec![ComputeBindingSet {
                ubos: Vec::new(),
                images: vec![(
                    target,
                    ImageLayout {
                        binding: 0,
                        descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                        stages: vk::ShaderStageFlags::COMPUTE,
                    },
                )],
            }],
            before_record: None,
            after_record: None,
        })
        .unwrap();
    scene
        .add_render_pass(RenderPassCreateInfo {
            command_buffer: Some(consume),
            output_is_swap_chain: true,
            outputs: Vec::new(),
        })
        .unwrap();
    scene.record().unwrap();

    let (graphics, compute) = queues(&mut scene);
    scene
        .frame(graphics, compute, 0, None, &[produce, consume], &[(produce, consume)])
        .unwrap();

    let submissions = scene.device().submissions();
    // Swapchain buffer, then producer, then consumer.
    assert_eq!(submissions.len(), 3);
    let producer_submit = &submissions[1];
    let consumer_submit = &submissions[2];
    assert_eq!(producer_submit.queue, compute);
    assert_eq!(consumer_submit.queue, graphics);
    assert!(producer_submit.waits.is_empty());
    assert_eq!(consumer_submit.waits.len(), 1);
    // The consumer waits on the producer's semaphore at the stage the
    // producer declared.
    assert_eq!(consumer_submit.waits[0].0, producer_submit.signals[0]);
    assert_eq!(
        consumer_submit.waits[0].1,
        vk::PipelineStageFlags::COMPUTE_SHADER
    );
}

#[test]
fn swapchain_compute_output_dispatches_per_image() {
    let mut scene = scene_over(2, false);
    scene
        .add_compute_pass(ComputePassCreateInfo {
            command_buffer: None,
            output_is_swap_chain: true,
            output_binding: 1,
            extent: EXTENT,
            dispatch_groups: vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            },
            shader: "shaders/tonemap.comp.spv".into(),
            bindings: Vec::new(),
            before_record: None,
            after_record: None,
        })
        .unwrap();
    scene.record().unwrap();

    // Each image's buffer holds exactly its own dispatch, ceil-divided over
    // the full extent.
    for cb in 0..2 {
        let commands = scene.device().commands(fenrir_graphics::CommandBufferId(cb));
        let dispatches: Vec<_> = commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { .. }))
            .collect();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(*dispatches[0], Command::Dispatch { groups: [120, 68, 1] });
    }
    // Every per-image pipeline instance wrote its swapchain image as a
    // storage output at the requested binding.
    assert_eq!(scene.device().descriptor_set_count(), 2);
    // Pool sized for one storage image per swapchain image.
    assert_eq!(scene.descriptor_pool().totals(), [0, 0, 0, 2, 0, 0]);
}

#[test]
fn mirror_target_blits_after_passes() {
    let mut scene = scene_over(2, true);
    scene
        .add_render_pass(RenderPassCreateInfo {
            command_buffer: None,
            output_is_swap_chain: true,
            outputs: Vec::new(),
        })
        .unwrap();
    scene.record().unwrap();

    // Mirroring flips the swapchain color attachment to transfer-src.
    let attachments = &scene.device().render_passes()[0];
    assert_eq!(
        attachments[1].final_layout,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    );

    let commands = scene.device().commands(fenrir_graphics::CommandBufferId(0));
    let tail = &commands[commands.len() - 3..];
    assert!(matches!(
        tail[0],
        Command::TransitionImageLayout {
            from: vk::ImageLayout::PRESENT_SRC_KHR,
            to: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            ..
        }
    ));
    assert!(matches!(tail[1], Command::BlitImage { .. }));
    assert!(matches!(
        tail[2],
        Command::TransitionImageLayout {
            from: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            to: vk::ImageLayout::PRESENT_SRC_KHR,
            ..
        }
    ));
}

#[test]
fn frame_submits_swapchain_buffer_with_image_available_wait() {
    let mut scene = scene_over(2, false);
    scene
        .add_render_pass(RenderPassCreateInfo {
            command_buffer: None,
            output_is_swap_chain: true,
            outputs: Vec::new(),
        })
        .unwrap();
    scene.record().unwrap();
    let (graphics, compute) = queues(&mut scene);
    let image_available = scene.device_mut().create_semaphore().unwrap();

    scene
        .frame(graphics, compute, 1, Some(image_available), &[], &[])
        .unwrap();

    let submissions = scene.device().submissions();
    assert_eq!(submissions.len(), 1);
    let submit = &submissions[0];
    assert_eq!(submit.queue, graphics);
    assert_eq!(submit.command_buffer, fenrir_graphics::CommandBufferId(1));
    assert_eq!(
        submit.waits,
        vec![(
            image_available,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        )]
    );
    assert_eq!(
        submit.signals,
        vec![scene.swap_chain_complete_semaphore().unwrap()]
    );
}
