//! Built-in scenes for the CLI and tests.

use super::{Camera, Light, Material, Scene, SceneMesh};
use crate::util::{Mat4, Result, Vec3};

/// Quad `a b c d` as two triangles, counter-clockwise seen from its front.
pub fn quad(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> SceneMesh {
    SceneMesh::new(vec![a, b, c, d], vec![[0, 1, 2], [0, 2, 3]])
}

/// Axis-aligned unit cube centred at the origin, faces pointing out.
pub fn cube() -> SceneMesh {
    let p = |x: f32, y: f32, z: f32| Vec3::new(x, y, z) * 0.5;
    let positions = vec![
        p(-1.0, -1.0, -1.0),
        p(1.0, -1.0, -1.0),
        p(1.0, 1.0, -1.0),
        p(-1.0, 1.0, -1.0),
        p(-1.0, -1.0, 1.0),
        p(1.0, -1.0, 1.0),
        p(1.0, 1.0, 1.0),
        p(-1.0, 1.0, 1.0),
    ];
    let indices = vec![
        [4, 5, 6],
        [4, 6, 7], // +z
        [1, 0, 3],
        [1, 3, 2], // -z
        [5, 1, 2],
        [5, 2, 6], // +x
        [0, 4, 7],
        [0, 7, 3], // -x
        [7, 6, 2],
        [7, 2, 3], // +y
        [0, 1, 5],
        [0, 5, 4], // -y
    ];
    SceneMesh::new(positions, indices)
}

/// Scene with nothing but a constant environment.
pub fn empty(background: Vec3) -> Result<Scene> {
    let mut scene = Scene::new();
    scene.add_light(Light::Background {
        intensity: background,
        texture: None,
    })?;
    Ok(scene)
}

/// Closed box with coloured side walls, two blocks and a ceiling light.
pub fn cornell_box() -> Result<Scene> {
    let mut scene = Scene::new();
    let white = scene.add_material(Material::diffuse(Vec3::splat(0.73)));
    let red = scene.add_material(Material::diffuse(Vec3::new(0.65, 0.05, 0.05)));
    let green = scene.add_material(Material::diffuse(Vec3::new(0.12, 0.45, 0.15)));
    let lamp = scene.add_material(Material::emissive(Vec3::splat(15.0)));

    let (lo, hi) = (-1.0f32, 1.0f32);
    let v = Vec3::new;
    // floor, ceiling, back
    scene.add_mesh(quad(v(lo, lo, hi), v(hi, lo, hi), v(hi, lo, lo), v(lo, lo, lo)), white)?;
    scene.add_mesh(quad(v(lo, hi, lo), v(hi, hi, lo), v(hi, hi, hi), v(lo, hi, hi)), white)?;
    scene.add_mesh(quad(v(lo, lo, lo), v(hi, lo, lo), v(hi, hi, lo), v(lo, hi, lo)), white)?;
    // left, right
    scene.add_mesh(quad(v(lo, lo, hi), v(lo, lo, lo), v(lo, hi, lo), v(lo, hi, hi)), red)?;
    scene.add_mesh(quad(v(hi, lo, lo), v(hi, lo, hi), v(hi, hi, hi), v(hi, hi, lo)), green)?;
    // lamp just under the ceiling, facing down
    let l = 0.25;
    scene.add_mesh(
        quad(v(-l, 0.99, -l), v(l, 0.99, -l), v(l, 0.99, l), v(-l, 0.99, l)),
        lamp,
    )?;

    let block = scene.add_mesh(cube(), white)?;
    scene.set_transform(
        block,
        Mat4::from_scale_rotation_translation(
            Vec3::new(0.6, 1.2, 0.6),
            crate::util::Quat::from_rotation_y(0.3),
            Vec3::new(-0.35, -0.4, -0.3),
        ),
    )?;
    scene.add_instance(
        block,
        Mat4::from_scale_rotation_translation(
            Vec3::splat(0.6),
            crate::util::Quat::from_rotation_y(-0.3),
            Vec3::new(0.35, -0.7, 0.3),
        ),
        white,
    )?;

    scene.add_light(Light::Point {
        position: Vec3::new(0.0, 0.9, 0.0),
        intensity: Vec3::splat(2.0),
    })?;

    let mut camera = Camera::look_at(Vec3::new(0.0, 0.0, 3.9), Vec3::ZERO, Vec3::Y);
    camera.fov_y = 40f32.to_radians();
    scene.set_camera(camera);
    Ok(scene)
}

/// A grid of instances of one mesh under a sun and sky.
pub fn instances(count: usize) -> Result<Scene> {
    let mut scene = Scene::new();
    let ground = scene.add_material(Material::diffuse(Vec3::splat(0.5)));
    let body = scene.add_material(Material::diffuse(Vec3::new(0.8, 0.6, 0.2)));

    let v = Vec3::new;
    scene.add_mesh(
        quad(v(-20.0, 0.0, 20.0), v(20.0, 0.0, 20.0), v(20.0, 0.0, -20.0), v(-20.0, 0.0, -20.0)),
        ground,
    )?;
    let base = scene.add_mesh(cube(), body)?;
    scene.set_transform(base, Mat4::from_translation(Vec3::new(0.0, 0.5, 0.0)))?;

    let side = (count as f32).sqrt().ceil().max(1.0) as usize;
    for i in 0..count {
        let (x, z) = ((i % side) as f32, (i / side) as f32);
        let offset = Vec3::new(x - side as f32 * 0.5, 0.5, -z - 2.0) * 1.5;
        scene.add_instance(base, Mat4::from_translation(offset), body)?;
    }

    scene.add_light(Light::Directional {
        direction: Vec3::new(-0.4, -1.0, -0.3),
        intensity: Vec3::splat(2.5),
    })?;
    scene.add_light(Light::Background {
        intensity: Vec3::new(0.4, 0.5, 0.7),
        texture: None,
    })?;

    let camera = Camera::look_at(Vec3::new(0.0, 4.0, 8.0), Vec3::new(0.0, 0.0, -3.0), Vec3::Y);
    scene.set_camera(camera);
    Ok(scene)
}
